use std::net::IpAddr;

use ahash::{HashSet, HashSetExt};
use ipnet::IpNet;
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// One CIDR block plus its used-set. Never hands back the network or
/// broadcast address, nor an address already in the used-set.
/// `allocate`/`release` are serialized by a single mutex per pool.
pub struct IpPool {
    cidr: IpNet,
    used: Mutex<HashSet<IpAddr>>,
}

impl IpPool {
    pub fn new(cidr: IpNet) -> Self {
        Self { cidr, used: Mutex::new(HashSet::new()) }
    }

    pub fn cidr(&self) -> IpNet {
        self.cidr
    }

    /// Returns the next free host address in ascending order, marking it
    /// used. `Exhausted` if the block has no free host addresses left.
    pub fn allocate(&self) -> Result<IpAddr> {
        let mut used = self.used.lock();

        for addr in self.cidr.hosts() {
            if addr == self.cidr.network() || addr == self.cidr.broadcast() {
                continue;
            }
            if !used.contains(&addr) {
                used.insert(addr);
                return Ok(addr);
            }
        }

        Err(Error::exhausted(format!("ip pool {} has no free addresses", self.cidr)))
    }

    /// Idempotent: releasing an address not currently held is a no-op.
    pub fn release(&self, address: IpAddr) {
        self.used.lock().remove(&address);
    }

    pub fn used_count(&self) -> usize {
        self.used.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_returns_network_or_broadcast() {
        let pool = IpPool::new("10.10.0.0/30".parse().unwrap());
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_ne!(a, "10.10.0.0".parse::<IpAddr>().unwrap());
        assert_ne!(a, "10.10.0.3".parse::<IpAddr>().unwrap());
        assert_ne!(b, "10.10.0.0".parse::<IpAddr>().unwrap());
        assert_ne!(b, "10.10.0.3".parse::<IpAddr>().unwrap());
        assert_ne!(a, b);
        assert!(pool.allocate().is_err());
    }

    #[test]
    fn released_address_is_reusable() {
        let pool = IpPool::new("10.10.0.0/30".parse().unwrap());
        let a = pool.allocate().unwrap();
        pool.release(a);
        let b = pool.allocate().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn releasing_an_unheld_address_is_a_no_op() {
        let pool = IpPool::new("10.10.0.0/29".parse().unwrap());
        pool.release("10.10.0.5".parse().unwrap());
        assert_eq!(pool.used_count(), 0);
    }
}
