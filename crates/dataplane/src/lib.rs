//! Data-plane adapter: the narrow capability surface a coordinator or peer
//! uses to stand up tunnel interfaces, provision peers, allocate addresses,
//! and manage NAT/forwarding.
//!
//! The core never talks to the kernel directly; it depends on [`DataPlane`]
//! as a trait object. [`memory::MemoryAdapter`] is the default binding
//! (in-process, used by every test in this workspace); [`os::OsAdapter`] is
//! the production binding and only compiles under the `os-dataplane` feature.

pub mod adapter;
pub mod error;
pub mod ip_pool;
pub mod memory;

#[cfg(feature = "os-dataplane")]
pub mod os;

pub use adapter::{DataPlane, PeerEntry};
pub use error::{Error, Result};
pub use ip_pool::IpPool;
pub use memory::MemoryAdapter;

#[cfg(feature = "os-dataplane")]
pub use os::OsAdapter;
