use async_trait::async_trait;

use crate::error::Result;

/// Peer entry as currently configured on a tunnel interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub public_key: String,
    pub allowed_addrs: Vec<String>,
    pub endpoint: Option<String>,
}

/// Abstract data-plane adapter. No state is shared with upper layers beyond
/// the narrow operations below; the core depends on this trait object,
/// never on a concrete binding.
#[async_trait]
pub trait DataPlane: Send + Sync {
    /// Idempotent: creating an interface that already exists succeeds silently.
    async fn interface_create(&self, name: &str) -> Result<()>;

    /// Deleting a non-existent interface returns `NotFound`; callers that
    /// treat cleanup as best-effort may ignore it.
    async fn interface_delete(&self, name: &str) -> Result<()>;

    async fn interface_configure(
        &self,
        name: &str,
        private_key: &str,
        listen_port: Option<u16>,
        address_cidr: Option<&str>,
    ) -> Result<()>;

    /// Idempotent keyed by `public_key`: a second call replaces the previous
    /// allowed-addrs and endpoint for that key.
    async fn peer_add(
        &self,
        interface: &str,
        public_key: &str,
        allowed_addrs: &[String],
        endpoint: Option<&str>,
    ) -> Result<()>;

    /// `NotFound` if no peer with `public_key` is configured on `interface`.
    async fn peer_remove(&self, interface: &str, public_key: &str) -> Result<()>;

    async fn peers(&self, interface: &str) -> Result<Vec<PeerEntry>>;

    /// May no-op if forwarding is already enabled.
    async fn forwarding_enable(&self) -> Result<()>;

    /// Installs a source-NAT rule masquerading `src_addr` out `egress_interface`.
    async fn nat_add(&self, src_addr: &str, egress_interface: &str) -> Result<()>;

    /// Must exactly reverse a prior `nat_add` with the same arguments.
    async fn nat_remove(&self, src_addr: &str, egress_interface: &str) -> Result<()>;

    async fn ip_pool_create(&self, pool_name: &str, cidr: &str) -> Result<()>;

    /// `Exhausted` if the named pool has no free host addresses.
    async fn ip_pool_allocate(&self, pool_name: &str) -> Result<String>;

    /// Idempotent: releasing an address not currently held is a no-op.
    async fn ip_pool_release(&self, pool_name: &str, address: &str) -> Result<()>;
}
