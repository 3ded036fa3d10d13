//! UID pool: enumerates UIDs starting at a configured value,
//! incrementing by 1.

use serde::{Deserialize, Serialize};

use super::{Pool, Poolable};
use crate::error::PoolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(pub u32);

impl Poolable for Uid {
    fn identity(&self) -> String {
        self.0.to_string()
    }

    fn next(&self) -> Self {
        Uid(self.0 + 1)
    }
}

pub struct UserPool {
    pool: Pool<Uid>,
}

impl UserPool {
    pub fn new(start: u32, size: usize) -> Self {
        Self {
            pool: Pool::new(Uid(start), size),
        }
    }

    pub fn acquire(&self) -> Result<Uid, PoolError> {
        self.pool.acquire()
    }

    pub fn release(&self, uid: Uid) {
        self.pool.release(uid);
    }

    pub fn remove(&self, uid: &Uid) -> bool {
        self.pool.remove(uid)
    }

    pub fn available(&self) -> usize {
        self.pool.available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumerates_consecutive_uids() {
        let p = UserPool::new(10000, 3);
        assert_eq!(p.acquire().unwrap(), Uid(10000));
        assert_eq!(p.acquire().unwrap(), Uid(10001));
        assert_eq!(p.acquire().unwrap(), Uid(10002));
        assert!(p.acquire().is_err());
    }
}
