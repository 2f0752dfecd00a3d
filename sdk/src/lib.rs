//! Peer-side control plane: the persistent stream client and the role/mode
//! controller (components C4 and C6 of the control-plane design).
//!
//! This crate never talks to a coordinator except through
//! [`client::PeerStreamClient`], and never touches the kernel except through
//! [`dataplane::DataPlane`] via [`role_controller::RoleController`].

pub mod client;
pub mod command_handler;
pub mod error;
pub mod idempotency;
pub mod role;
pub mod role_controller;

pub use client::{ClientConfig, ConnectionState, ExitGrant, PeerStreamClient};
pub use command_handler::{CommandHandler, HandlerRegistry};
pub use error::{Error, Result};
pub use idempotency::IdempotencyCache;
pub use role::Role;
pub use role_controller::{ExitInterfaceConfig, RoleController};
