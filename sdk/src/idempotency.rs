use std::collections::VecDeque;

use ahash::{HashMap, HashMapExt};
#[cfg(test)]
use std::collections::HashMap as StdHashMap;
use parking_lot::Mutex;
use proto::proto::CommandResponse;

const DEFAULT_CAPACITY: usize = 256;

/// Bounded LRU of already-applied command ids, keyed by `command_id`.
/// Handlers are idempotent keyed by (peer identifier, command identifier) —
/// the peer identifier half of that key is implicit here, since one client
/// instance only ever sees commands addressed to itself. A replayed command
/// id returns the cached response instead of re-running the handler, so a
/// retransmitted Command never double-applies its side effects.
pub struct IdempotencyCache {
    capacity: usize,
    order: Mutex<VecDeque<String>>,
    entries: Mutex<HashMap<String, CommandResponse>>,
}

impl IdempotencyCache {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, order: Mutex::new(VecDeque::new()), entries: Mutex::new(HashMap::new()) }
    }

    pub fn get(&self, command_id: &str) -> Option<CommandResponse> {
        self.entries.lock().get(command_id).cloned()
    }

    pub fn record(&self, command_id: String, response: CommandResponse) {
        let mut entries = self.entries.lock();
        let mut order = self.order.lock();

        if entries.insert(command_id.clone(), response).is_none() {
            order.push_back(command_id);
            while order.len() > self.capacity {
                if let Some(evicted) = order.pop_front() {
                    entries.remove(&evicted);
                }
            }
        }
    }
}

impl Default for IdempotencyCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(command_id: &str) -> CommandResponse {
        CommandResponse { command_id: command_id.to_string(), success: true, message: String::new(), result: StdHashMap::new() }
    }

    #[test]
    fn replayed_command_id_returns_the_cached_response() {
        let cache = IdempotencyCache::new(4);
        cache.record("c-1".to_string(), response("c-1"));
        assert_eq!(cache.get("c-1"), Some(response("c-1")));
        assert_eq!(cache.get("c-2"), None);
    }

    #[test]
    fn capacity_is_enforced_oldest_first() {
        let cache = IdempotencyCache::new(2);
        cache.record("c-1".to_string(), response("c-1"));
        cache.record("c-2".to_string(), response("c-2"));
        cache.record("c-3".to_string(), response("c-3"));

        assert_eq!(cache.get("c-1"), None);
        assert!(cache.get("c-2").is_some());
        assert!(cache.get("c-3").is_some());
    }
}
