use std::time::{Duration, Instant};

use ahash::{HashMap, HashMapExt};
use parking_lot::Mutex;

pub const REPLAY_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Sliding-window replay protection for authentication nonces. Keyed by
/// `(peer_id, nonce)`; entries older than the replay window are pruned
/// lazily on each check rather than by a background task, since the window
/// is small and checks are infrequent relative to the session sweep.
#[derive(Default)]
pub struct NonceLedger {
    seen: Mutex<HashMap<(String, String), Instant>>,
}

impl NonceLedger {
    /// Returns `true` if the nonce was fresh (not seen within the replay
    /// window) and has now been remembered; `false` if it is a replay.
    pub fn check_and_remember(&self, peer_id: &str, nonce_b64: &str) -> bool {
        let key = (peer_id.to_string(), nonce_b64.to_string());
        let now = Instant::now();
        let mut seen = self.seen.lock();

        seen.retain(|_, ts| now.duration_since(*ts) < REPLAY_WINDOW);

        if seen.contains_key(&key) {
            return false;
        }

        seen.insert(key, now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_use_is_fresh_replay_is_rejected() {
        let ledger = NonceLedger::default();
        assert!(ledger.check_and_remember("p1", "nonce-a"));
        assert!(!ledger.check_and_remember("p1", "nonce-a"));
    }

    #[test]
    fn same_nonce_different_peer_is_independent() {
        let ledger = NonceLedger::default();
        assert!(ledger.check_and_remember("p1", "nonce-a"));
        assert!(ledger.check_and_remember("p2", "nonce-a"));
    }
}
