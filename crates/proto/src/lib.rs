//! Wire messages for the vpnctl control plane.
//!
//! The generated `vpnctl.control` protobuf types (`ControlMessage`,
//! `AuthRequest`, `Command`, ...) and the `Control` / `Directory` /
//! `InterCoordinator` gRPC service stubs live under [`proto`]. This crate
//! also carries the signature primitives used by the authentication
//! handshake (§4.3 of the control-plane spec), since the wire format and
//! the signing scheme it encodes are tightly coupled.

pub mod crypto;

pub mod proto {
    tonic::include_proto!("vpnctl.control");
}

use std::fmt;

/// Two-character literal separator used when building the authentication
/// signing payload: `peer_id || role || region || nonce_b64`.
pub const AUTH_SIGNING_SEPARATOR: &str = "||";

/// Builds the exact byte sequence an `AuthRequest` signature is computed
/// over. Kept in one place so the signer (peer) and the verifier
/// (coordinator) can never drift apart on the signing payload shape.
pub fn auth_signing_payload(peer_id: &str, role: &str, region: &str, nonce_b64: &str) -> Vec<u8> {
    [peer_id, role, region, nonce_b64].join(AUTH_SIGNING_SEPARATOR).into_bytes()
}

#[derive(Debug)]
pub enum Error {
    InvalidKey,
    InvalidSignature,
    Base64(base64::DecodeError),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidKey => write!(f, "malformed public or private key"),
            Self::InvalidSignature => write!(f, "malformed or undecodable signature"),
            Self::Base64(e) => write!(f, "base64 decode error: {}", e),
        }
    }
}

impl From<base64::DecodeError> for Error {
    fn from(value: base64::DecodeError) -> Self {
        Self::Base64(value)
    }
}
