use std::time::{Duration, Instant};

use ahash::{HashMap, HashMapExt};
use parking_lot::Mutex;
use tokio::time::Instant as TokioInstant;
use tokio_util::sync::CancellationToken;

pub const DIRECTORY_TTL: Duration = Duration::from_secs(300);
pub const DIRECTORY_QUERY_FRESHNESS: Duration = Duration::from_secs(120);
pub const DIRECTORY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// One known remote coordinator. Entries are keyed by coordinator
/// identifier, not region — multiple entries per region are expected and
/// normal.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub coordinator_id: String,
    pub region: String,
    pub address: String,
    pub load: u32,
    pub capacity: u32,
    last_heartbeat: Instant,
}

impl DirectoryEntry {
    fn is_stale(&self, ttl: Duration) -> bool {
        self.last_heartbeat.elapsed() > ttl
    }

    fn is_fresh_for_query(&self, freshness: Duration) -> bool {
        self.last_heartbeat.elapsed() < freshness
    }

    fn has_capacity(&self) -> bool {
        self.load < self.capacity
    }
}

/// Process-wide registry of known coordinators keyed by region. Never
/// raises: registration always succeeds for well-formed input, and an
/// unresponsive coordinator is handled by the exit orchestrator's
/// candidate-walk policy, not by directory retraction.
#[derive(Default)]
pub struct Directory {
    entries: Mutex<HashMap<String, DirectoryEntry>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or updates an entry and stamps its heartbeat.
    pub fn register(&self, coordinator_id: &str, region: &str, address: &str, load: u32, capacity: u32) {
        self.entries.lock().insert(
            coordinator_id.to_string(),
            DirectoryEntry {
                coordinator_id: coordinator_id.to_string(),
                region: region.to_string(),
                address: address.to_string(),
                load,
                capacity,
                last_heartbeat: Instant::now(),
            },
        );
    }

    /// Non-stale entries for `region` under capacity, ordered ascending by
    /// `(load, coordinator_id)` for deterministic candidate walks.
    pub fn candidates(&self, region: &str) -> Vec<DirectoryEntry> {
        let mut candidates: Vec<DirectoryEntry> = self
            .entries
            .lock()
            .values()
            .filter(|e| {
                e.region == region
                    && e.is_fresh_for_query(DIRECTORY_QUERY_FRESHNESS)
                    && e.has_capacity()
            })
            .cloned()
            .collect();

        candidates.sort_by(|a, b| a.load.cmp(&b.load).then_with(|| a.coordinator_id.cmp(&b.coordinator_id)));
        candidates
    }

    pub fn list_all(&self) -> Vec<DirectoryEntry> {
        self.entries.lock().values().cloned().collect()
    }

    /// Evicts entries whose heartbeat is older than `ttl`. Returns the
    /// evicted coordinator ids.
    pub fn sweep(&self, ttl: Duration) -> Vec<String> {
        let mut entries = self.entries.lock();
        let stale: Vec<String> = entries
            .values()
            .filter(|e| e.is_stale(ttl))
            .map(|e| e.coordinator_id.clone())
            .collect();

        for id in &stale {
            entries.remove(id);
        }

        stale
    }

    pub async fn run_sweeper(self: std::sync::Arc<Self>, interval: Duration, ttl: Duration, cancellation: CancellationToken) {
        let mut ticker = tokio::time::interval_at(TokioInstant::now() + interval, interval);

        loop {
            tokio::select! {
                _ = cancellation.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = self.sweep(ttl);
                    if !evicted.is_empty() {
                        log::info!("directory swept {} stale entries: {:?}", evicted.len(), evicted);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_are_ordered_by_load_then_id() {
        let directory = Directory::new();
        directory.register("c-b", "us", "10.0.0.2:9000", 5, 10);
        directory.register("c-a", "us", "10.0.0.1:9000", 5, 10);
        directory.register("c-c", "us", "10.0.0.3:9000", 1, 10);

        let candidates = directory.candidates("us");
        let ids: Vec<&str> = candidates.iter().map(|e| e.coordinator_id.as_str()).collect();
        assert_eq!(ids, vec!["c-c", "c-a", "c-b"]);
    }

    #[test]
    fn candidates_exclude_full_capacity_and_other_regions() {
        let directory = Directory::new();
        directory.register("c-a", "us", "10.0.0.1:9000", 10, 10);
        directory.register("c-b", "eu", "10.0.0.2:9000", 0, 10);

        assert!(directory.candidates("us").is_empty());
        assert!(directory.candidates("eu").iter().any(|e| e.coordinator_id == "c-b"));
    }

    #[test]
    fn sweep_evicts_only_stale_entries() {
        let directory = Directory::new();
        directory.register("c-a", "us", "10.0.0.1:9000", 0, 10);

        let evicted = directory.sweep(Duration::from_secs(0));
        assert_eq!(evicted, vec!["c-a".to_string()]);
        assert!(directory.list_all().is_empty());
    }

    #[test]
    fn empty_candidate_list_is_legitimate() {
        let directory = Directory::new();
        assert!(directory.candidates("nowhere").is_empty());
    }
}
