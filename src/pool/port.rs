//! Port pool: enumerates TCP ports.
//!
//! Starts at a configured port, or one past the kernel's local port
//! range upper bound (read from
//! `/proc/sys/net/ipv4/ip_local_port_range`) if the configured start is
//! negative. Hard upper bound 65000; constructor rejects starts below
//! 1024 or ranges exceeding the bound.

use std::fs;

use serde::{Deserialize, Serialize};

use super::{Pool, Poolable};
use crate::error::PoolError;

const MAX_PORT: u32 = 65000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Port(pub u16);

impl Poolable for Port {
    fn identity(&self) -> String {
        self.0.to_string()
    }

    fn next(&self) -> Self {
        Port(self.0 + 1)
    }
}

/// Read the kernel's local (ephemeral) port range upper bound from
/// procfs. Falls back to 61000 (the common Linux default) when the
/// knob can't be read, e.g. running in a sandbox without `/proc`.
fn ip_local_port_range_upper() -> u16 {
    const FALLBACK: u16 = 61000;
    let Ok(contents) = fs::read_to_string("/proc/sys/net/ipv4/ip_local_port_range") else {
        return FALLBACK;
    };
    let mut parts = contents.split_whitespace();
    let (Some(_first), Some(last)) = (parts.next(), parts.next()) else {
        return FALLBACK;
    };
    last.parse().unwrap_or(FALLBACK)
}

pub struct PortPool {
    pool: Pool<Port>,
}

impl PortPool {
    /// `start < 0` means "derive from the kernel's ephemeral range";
    /// `size == 0` means "everything up to the hard ceiling".
    pub fn new(start: i32, size: usize) -> Result<Self, PoolError> {
        let start: u32 = if start < 0 {
            ip_local_port_range_upper() as u32 + 1
        } else {
            start as u32
        };

        if start < 1024 || start >= MAX_PORT {
            return Err(PoolError::InvalidStart(start.to_string()));
        }

        let size = if size == 0 {
            (MAX_PORT - start) as usize
        } else {
            size
        };

        if size == 0 || start + size as u32 > MAX_PORT {
            return Err(PoolError::InvalidSize(size.to_string()));
        }

        Ok(Self {
            pool: Pool::new(Port(start as u16), size),
        })
    }

    pub fn acquire(&self) -> Result<Port, PoolError> {
        self.pool.acquire()
    }

    pub fn release(&self, port: Port) {
        self.pool.release(port);
    }

    pub fn remove(&self, port: &Port) -> bool {
        self.pool.remove(port)
    }

    pub fn available(&self) -> usize {
        self.pool.available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_start_below_1024() {
        assert!(matches!(
            PortPool::new(80, 10),
            Err(PoolError::InvalidStart(_))
        ));
    }

    #[test]
    fn rejects_start_at_or_above_max() {
        assert!(matches!(
            PortPool::new(65000, 10),
            Err(PoolError::InvalidStart(_))
        ));
    }

    #[test]
    fn zero_size_defaults_to_remainder() {
        let p = PortPool::new(60000, 0).unwrap();
        assert_eq!(p.available(), (MAX_PORT - 60000) as usize);
    }

    #[test]
    fn acquire_release_round_trip() {
        let p = PortPool::new(2000, 2).unwrap();
        let a = p.acquire().unwrap();
        assert_eq!(a, Port(2000));
        p.release(a);
        assert_eq!(p.acquire().unwrap(), Port(2000));
    }
}
