//! Network pool: enumerates IPv4 /30 subnets.
//!
//! Each element is a /30 base address; `next` advances by 4. The pool
//! element serialises to a dotted-quad JSON string so it round-trips
//! through a snapshot directly.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use super::{Pool, Poolable};
use crate::error::PoolError;

/// A single /30 subnet, identified by its base (`.0`) address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Subnet(Ipv4Addr);

impl Subnet {
    pub fn base(&self) -> Ipv4Addr {
        self.0
    }

    /// Offset the subnet base by `i` (used to compute `.1`/`.2` host and
    /// container addresses from the `.0` subnet base).
    pub fn add(&self, i: u32) -> Ipv4Addr {
        let u: u32 = self.0.into();
        Ipv4Addr::from(u + i)
    }
}

impl Poolable for Subnet {
    fn identity(&self) -> String {
        self.0.to_string()
    }

    fn next(&self) -> Self {
        let u: u32 = self.0.into();
        Subnet(Ipv4Addr::from(u + 4))
    }
}

/// Pool of /30 subnets.
pub struct NetworkPool {
    pool: Pool<Subnet>,
}

impl NetworkPool {
    /// `start` is masked down to its /30 base address.
    pub fn new(start: Ipv4Addr, size: usize) -> Self {
        let u: u32 = start.into();
        let base = Ipv4Addr::from(u & !0b11);
        Self {
            pool: Pool::new(Subnet(base), size),
        }
    }

    pub fn acquire(&self) -> Result<Subnet, PoolError> {
        self.pool.acquire()
    }

    pub fn release(&self, subnet: Subnet) {
        self.pool.release(subnet);
    }

    pub fn remove(&self, subnet: &Subnet) -> bool {
        self.pool.remove(subnet)
    }

    pub fn available(&self) -> usize {
        self.pool.available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_two_acquires_are_four_apart() {
        let p = NetworkPool::new("10.0.0.0".parse().unwrap(), 4);
        let a = p.acquire().unwrap();
        let b = p.acquire().unwrap();
        assert_eq!(a.base(), "10.0.0.0".parse::<Ipv4Addr>().unwrap());
        assert_eq!(b.base(), "10.0.0.4".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn release_then_acquire_returns_same_element() {
        let p = NetworkPool::new("10.0.0.0".parse().unwrap(), 1);
        let a = p.acquire().unwrap();
        assert!(p.acquire().is_err());
        p.release(a);
        let b = p.acquire().unwrap();
        assert_eq!(a.base(), b.base());
    }

    #[test]
    fn add_offsets_host_and_container_ips() {
        let p = NetworkPool::new("10.0.0.0".parse().unwrap(), 1);
        let subnet = p.acquire().unwrap();
        assert_eq!(subnet.add(1), "10.0.0.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(subnet.add(2), "10.0.0.2".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn serialises_as_dotted_quad_string() {
        let s = Subnet("10.0.0.0".parse().unwrap());
        let json = serde_json::to_string(&s).unwrap();
        assert_eq!(json, "\"10.0.0.0\"");
    }
}
