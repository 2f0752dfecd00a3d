//! Ed25519 signing and verification for peer authentication (§4.3).
//!
//! Keys and signatures are carried on the wire as base64-standard strings;
//! the helpers here centralize the encode/decode so callers never hand-roll
//! base64 alphabets or forget standard (vs. URL-safe) padding.

use base64::{Engine, engine::general_purpose::STANDARD};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::Error;

/// A freshly generated Ed25519 keypair, for peers bootstrapping an identity.
pub struct Keypair {
    pub signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn public_key_b64(&self) -> String {
        STANDARD.encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Signs `peer_id||role||region||nonce_b64` and returns the base64
    /// encoding of the signature, ready to drop into an `AuthRequest`.
    pub fn sign_auth(&self, peer_id: &str, role: &str, region: &str, nonce_b64: &str) -> String {
        let payload = crate::auth_signing_payload(peer_id, role, region, nonce_b64);
        STANDARD.encode(self.signing_key.sign(&payload).to_bytes())
    }
}

/// Generates a fresh, base64-encoded 16-byte (128-bit) nonce.
///
/// # Example
///
/// ```
/// use vpnctl_proto::crypto::generate_nonce_b64;
///
/// let nonce = generate_nonce_b64();
/// assert_eq!(base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &nonce).unwrap().len(), 16);
/// ```
pub fn generate_nonce_b64() -> String {
    use rand::RngCore;

    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

/// Verifies an `AuthRequest` signature against its declared public key.
///
/// # Example
///
/// ```
/// use vpnctl_proto::crypto::{Keypair, verify_auth, generate_nonce_b64};
///
/// let kp = Keypair::generate();
/// let nonce = generate_nonce_b64();
/// let sig = kp.sign_auth("p1", "client", "us", &nonce);
///
/// assert!(verify_auth("p1", "client", "us", &nonce, &kp.public_key_b64(), &sig).is_ok());
/// ```
pub fn verify_auth(
    peer_id: &str,
    role: &str,
    region: &str,
    nonce_b64: &str,
    public_key_b64: &str,
    signature_b64: &str,
) -> Result<(), Error> {
    let key_bytes = STANDARD.decode(public_key_b64)?;
    let key_bytes: [u8; 32] = key_bytes.as_slice().try_into().map_err(|_| Error::InvalidKey)?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| Error::InvalidKey)?;

    let sig_bytes = STANDARD.decode(signature_b64)?;
    let sig_bytes: [u8; 64] = sig_bytes.as_slice().try_into().map_err(|_| Error::InvalidSignature)?;
    let signature = Signature::from_bytes(&sig_bytes);

    let payload = crate::auth_signing_payload(peer_id, role, region, nonce_b64);
    verifying_key
        .verify(&payload, &signature)
        .map_err(|_| Error::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_round_trips() {
        let kp = Keypair::generate();
        let nonce = generate_nonce_b64();
        let sig = kp.sign_auth("peer-a", "client", "us-east", &nonce);

        verify_auth("peer-a", "client", "us-east", &nonce, &kp.public_key_b64(), &sig).unwrap();
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let nonce = generate_nonce_b64();
        let sig = kp.sign_auth("peer-a", "client", "us-east", &nonce);

        let err = verify_auth(
            "peer-a",
            "client",
            "us-east",
            &nonce,
            &other.public_key_b64(),
            &sig,
        )
        .unwrap_err();

        assert!(matches!(err, Error::InvalidSignature));
    }

    #[test]
    fn verify_rejects_tampered_field() {
        let kp = Keypair::generate();
        let nonce = generate_nonce_b64();
        let sig = kp.sign_auth("peer-a", "client", "us-east", &nonce);

        let err = verify_auth("peer-a", "exit", "us-east", &nonce, &kp.public_key_b64(), &sig)
            .unwrap_err();

        assert!(matches!(err, Error::InvalidSignature));
    }
}
