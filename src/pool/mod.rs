//! Generic resource pool.
//!
//! A pool is constructed from a first element and a size `n`; it
//! materialises `e0, e1 = next(e0), ..., e(n-1)` and stores it as an
//! ordered FIFO sequence behind a single mutex. `acquire` pops the
//! head, `release` appends to the tail, `remove` scans for a specific
//! element by identity (used only during snapshot restore, where it's
//! acceptable to pay O(n)).

pub mod network;
pub mod port;
pub mod user;

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::error::PoolError;

/// An element that can live in a generic [`Pool`].
///
/// Elements are compared and looked up by `identity()` (a stable string
/// key), not by `PartialEq`, so the pool stays agnostic to the concrete
/// element representation (dotted-quad string, port number, uid).
pub trait Poolable: Clone + Send + Sync {
    /// Stable identity used for equality and as the "found" answer to
    /// `remove`.
    fn identity(&self) -> String;

    /// The successor element in enumeration order.
    fn next(&self) -> Self;
}

/// Generic ordered pool of enumerable values.
///
/// All three operations are serialised by a single mutex; `acquire`
/// and `release` are O(1), `remove` is O(n) (acceptable: it is only
/// used on snapshot restore).
pub struct Pool<T: Poolable> {
    items: Mutex<VecDeque<T>>,
}

impl<T: Poolable> Pool<T> {
    /// Materialise a pool of `size` elements starting at `first`.
    pub fn new(first: T, size: usize) -> Self {
        let mut items = VecDeque::with_capacity(size);
        let mut cur = first;
        for _ in 0..size {
            let nxt = cur.next();
            items.push_back(cur);
            cur = nxt;
        }
        Self {
            items: Mutex::new(items),
        }
    }

    /// Remove and return the head of the queue. `Err(PoolError::Exhausted)`
    /// iff the pool is empty.
    pub fn acquire(&self) -> Result<T, PoolError> {
        let mut items = self.items.lock();
        items.pop_front().ok_or(PoolError::Exhausted)
    }

    /// Append `element` at the tail. No check that `element` was ever
    /// part of the pool; callers are trusted.
    pub fn release(&self, element: T) {
        self.items.lock().push_back(element);
    }

    /// Scan for an element with matching identity, remove it, and
    /// report whether it was found. Used during snapshot restore to
    /// reserve a specific element out of FIFO order.
    pub fn remove(&self, element: &T) -> bool {
        let mut items = self.items.lock();
        let id = element.identity();
        if let Some(pos) = items.iter().position(|e| e.identity() == id) {
            items.remove(pos);
            true
        } else {
            false
        }
    }

    /// Number of elements currently available for acquisition.
    pub fn available(&self) -> usize {
        self.items.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq)]
    struct Counter(u32);

    impl Poolable for Counter {
        fn identity(&self) -> String {
            self.0.to_string()
        }

        fn next(&self) -> Self {
            Counter(self.0 + 1)
        }
    }

    #[test]
    fn acquire_is_fifo_and_exhausts() {
        let p = Pool::new(Counter(0), 3);
        assert_eq!(p.acquire().unwrap(), Counter(0));
        assert_eq!(p.acquire().unwrap(), Counter(1));
        assert_eq!(p.acquire().unwrap(), Counter(2));
        assert_eq!(p.acquire(), Err(PoolError::Exhausted));
    }

    #[test]
    fn release_then_acquire_round_trips_without_jumping_queue() {
        let p = Pool::new(Counter(0), 2);
        let a = p.acquire().unwrap();
        let _b = p.acquire().unwrap();
        p.release(a.clone());
        // queue is now just [a]; released element doesn't jump ahead
        // of anything because nothing else is queued.
        assert_eq!(p.acquire().unwrap(), a);
    }

    #[test]
    fn remove_reserves_specific_element_out_of_order() {
        let p = Pool::new(Counter(0), 5);
        assert!(p.remove(&Counter(3)));
        assert!(!p.remove(&Counter(3))); // already removed
        assert_eq!(p.available(), 4);
    }

    #[test]
    fn held_and_free_sets_stay_disjoint() {
        let p = Pool::new(Counter(0), 4);
        let mut held = Vec::new();
        held.push(p.acquire().unwrap());
        held.push(p.acquire().unwrap());
        p.release(held.pop().unwrap());
        held.push(p.acquire().unwrap());
        // every acquired-and-not-released element must be unique
        let mut seen = std::collections::HashSet::new();
        for h in &held {
            assert!(seen.insert(h.identity()));
        }
    }
}
