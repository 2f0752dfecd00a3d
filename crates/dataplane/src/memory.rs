use std::net::IpAddr;

use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    adapter::{DataPlane, PeerEntry},
    error::{Error, Result},
    ip_pool::IpPool,
};

#[derive(Default)]
struct Interface {
    private_key: Option<String>,
    listen_port: Option<u16>,
    address_cidr: Option<String>,
    peers: HashMap<String, PeerEntry>,
}

/// In-memory fake binding for C1, used by default everywhere except builds
/// with the `os-dataplane` feature enabled. Every operation's contract
/// (idempotence, `NotFound` on absent entities, reversibility of NAT rules)
/// is enforced here exactly as specified, so tests against this binding
/// exercise the real control-plane rollback logic.
#[derive(Default)]
pub struct MemoryAdapter {
    interfaces: Mutex<HashMap<String, Interface>>,
    nat_rules: Mutex<HashSet<(String, String)>>,
    forwarding_enabled: Mutex<bool>,
    pools: Mutex<HashMap<String, IpPool>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forwarding_enabled(&self) -> bool {
        *self.forwarding_enabled.lock()
    }

    pub fn nat_rule_exists(&self, src_addr: &str, egress_interface: &str) -> bool {
        self.nat_rules.lock().contains(&(src_addr.to_string(), egress_interface.to_string()))
    }
}

#[async_trait]
impl DataPlane for MemoryAdapter {
    async fn interface_create(&self, name: &str) -> Result<()> {
        self.interfaces.lock().entry(name.to_string()).or_default();
        Ok(())
    }

    async fn interface_delete(&self, name: &str) -> Result<()> {
        self.interfaces
            .lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("no such interface: {name}")))
    }

    async fn interface_configure(
        &self,
        name: &str,
        private_key: &str,
        listen_port: Option<u16>,
        address_cidr: Option<&str>,
    ) -> Result<()> {
        if private_key.trim().is_empty() {
            return Err(Error::invalid_argument("private key must not be empty"));
        }

        let mut interfaces = self.interfaces.lock();
        let iface = interfaces.entry(name.to_string()).or_default();
        iface.private_key = Some(private_key.to_string());
        if listen_port.is_some() {
            iface.listen_port = listen_port;
        }
        if let Some(cidr) = address_cidr {
            iface.address_cidr = Some(cidr.to_string());
        }
        Ok(())
    }

    async fn peer_add(
        &self,
        interface: &str,
        public_key: &str,
        allowed_addrs: &[String],
        endpoint: Option<&str>,
    ) -> Result<()> {
        let mut interfaces = self.interfaces.lock();
        let iface = interfaces
            .get_mut(interface)
            .ok_or_else(|| Error::not_found(format!("no such interface: {interface}")))?;

        iface.peers.insert(
            public_key.to_string(),
            PeerEntry {
                public_key: public_key.to_string(),
                allowed_addrs: allowed_addrs.to_vec(),
                endpoint: endpoint.map(str::to_string),
            },
        );
        Ok(())
    }

    async fn peer_remove(&self, interface: &str, public_key: &str) -> Result<()> {
        let mut interfaces = self.interfaces.lock();
        let iface = interfaces
            .get_mut(interface)
            .ok_or_else(|| Error::not_found(format!("no such interface: {interface}")))?;

        iface
            .peers
            .remove(public_key)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("no such peer: {public_key}")))
    }

    async fn peers(&self, interface: &str) -> Result<Vec<PeerEntry>> {
        let interfaces = self.interfaces.lock();
        let iface = interfaces
            .get(interface)
            .ok_or_else(|| Error::not_found(format!("no such interface: {interface}")))?;
        Ok(iface.peers.values().cloned().collect())
    }

    async fn forwarding_enable(&self) -> Result<()> {
        *self.forwarding_enabled.lock() = true;
        Ok(())
    }

    async fn nat_add(&self, src_addr: &str, egress_interface: &str) -> Result<()> {
        self.nat_rules.lock().insert((src_addr.to_string(), egress_interface.to_string()));
        Ok(())
    }

    async fn nat_remove(&self, src_addr: &str, egress_interface: &str) -> Result<()> {
        self.nat_rules.lock().remove(&(src_addr.to_string(), egress_interface.to_string()));
        Ok(())
    }

    async fn ip_pool_create(&self, pool_name: &str, cidr: &str) -> Result<()> {
        let net = cidr
            .parse()
            .map_err(|_| Error::invalid_argument(format!("malformed cidr: {cidr}")))?;
        self.pools.lock().entry(pool_name.to_string()).or_insert_with(|| IpPool::new(net));
        Ok(())
    }

    async fn ip_pool_allocate(&self, pool_name: &str) -> Result<String> {
        let pools = self.pools.lock();
        let pool = pools
            .get(pool_name)
            .ok_or_else(|| Error::not_found(format!("no such ip pool: {pool_name}")))?;
        pool.allocate().map(|addr| addr.to_string())
    }

    async fn ip_pool_release(&self, pool_name: &str, address: &str) -> Result<()> {
        let pools = self.pools.lock();
        let pool = pools
            .get(pool_name)
            .ok_or_else(|| Error::not_found(format!("no such ip pool: {pool_name}")))?;
        let addr: IpAddr = address
            .parse()
            .map_err(|_| Error::invalid_argument(format!("malformed address: {address}")))?;
        pool.release(addr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peer_add_is_idempotent_keyed_by_public_key() {
        let adapter = MemoryAdapter::new();
        adapter.interface_create("wg-exit0").await.unwrap();

        adapter
            .peer_add("wg-exit0", "pubkey-a", &["10.0.0.2/32".to_string()], Some("1.2.3.4:51820"))
            .await
            .unwrap();
        adapter
            .peer_add("wg-exit0", "pubkey-a", &["10.0.0.9/32".to_string()], None)
            .await
            .unwrap();

        let peers = adapter.peers("wg-exit0").await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].allowed_addrs, vec!["10.0.0.9/32".to_string()]);
        assert_eq!(peers[0].endpoint, None);
    }

    #[tokio::test]
    async fn peer_remove_on_absent_peer_is_not_found() {
        let adapter = MemoryAdapter::new();
        adapter.interface_create("wg-exit0").await.unwrap();
        assert!(matches!(adapter.peer_remove("wg-exit0", "nope").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn nat_add_then_remove_is_exactly_reversible() {
        let adapter = MemoryAdapter::new();
        adapter.nat_add("10.0.0.2", "eth0").await.unwrap();
        assert!(adapter.nat_rule_exists("10.0.0.2", "eth0"));
        adapter.nat_remove("10.0.0.2", "eth0").await.unwrap();
        assert!(!adapter.nat_rule_exists("10.0.0.2", "eth0"));
    }

    #[tokio::test]
    async fn interface_delete_on_absent_interface_is_not_found() {
        let adapter = MemoryAdapter::new();
        assert!(matches!(adapter.interface_delete("ghost").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn ip_pool_allocate_respects_exhaustion() {
        let adapter = MemoryAdapter::new();
        adapter.ip_pool_create("relay", "10.20.0.0/30").await.unwrap();
        let a = adapter.ip_pool_allocate("relay").await.unwrap();
        let b = adapter.ip_pool_allocate("relay").await.unwrap();
        assert_ne!(a, b);
        assert!(matches!(adapter.ip_pool_allocate("relay").await, Err(Error::Exhausted(_))));

        adapter.ip_pool_release("relay", &a).await.unwrap();
        assert_eq!(adapter.ip_pool_allocate("relay").await.unwrap(), a);
    }
}
