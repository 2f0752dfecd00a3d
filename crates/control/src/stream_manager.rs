use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use ahash::{HashMap, HashMapExt};
use parking_lot::RwLock;
use proto::proto::{Command, CommandResponse, CommandType, ControlMessage, control_message::Payload};
use tokio::time::Instant as TokioInstant;

use crate::{
    error::{Error, Result},
    nonce::NonceLedger,
    session::{Role, Session},
};

pub const SESSION_STALE_TIMEOUT: Duration = Duration::from_secs(120);
pub const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Default)]
struct Observability {
    auth_failures_total: AtomicU64,
    commands_dispatched_total: AtomicU64,
    commands_succeeded_total: AtomicU64,
    commands_failed_total: AtomicU64,
}

/// Owns the set of authenticated peer sessions for one coordinator. The
/// `peer_id -> Session` map is a reader-writer lock over an `ahash` map:
/// reads (dispatch, snapshot) dominate, writes happen on
/// register/unregister/evict.
pub struct StreamManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    nonces: NonceLedger,
    stats: Observability,
    stale_timeout: Duration,
}

impl Default for StreamManager {
    fn default() -> Self {
        Self::new(SESSION_STALE_TIMEOUT)
    }
}

impl StreamManager {
    pub fn new(stale_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            nonces: NonceLedger::default(),
            stats: Observability::default(),
            stale_timeout,
        }
    }

    /// Rejects a nonce seen within the replay window.
    pub fn check_and_remember_nonce(&self, peer_id: &str, nonce_b64: &str) -> bool {
        self.nonces.check_and_remember(peer_id, nonce_b64)
    }

    pub fn record_auth_failure(&self) {
        self.stats.auth_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn auth_failures_total(&self) -> u64 {
        self.stats.auth_failures_total.load(Ordering::Relaxed)
    }

    /// Inserts a newly authenticated session, atomically evicting any prior
    /// active session for the same peer_id. At most one active session may
    /// exist per peer identifier at a time.
    pub fn register(&self, session: Arc<Session>) {
        let mut sessions = self.sessions.write();

        if let Some(previous) = sessions.remove(&session.peer_id) {
            previous.mark_inactive();
            log::info!(
                "evicted prior session for peer_id={} (superseded by session_id={})",
                session.peer_id,
                session.session_id
            );
        }

        sessions.insert(session.peer_id.clone(), session);
    }

    /// Removes a session unconditionally (transport closed, stale eviction,
    /// or explicit disconnect). Idempotent: removing an absent peer_id is a
    /// no-op.
    pub fn unregister(&self, peer_id: &str) {
        if let Some(session) = self.sessions.write().remove(peer_id) {
            session.mark_inactive();
        }
    }

    pub fn get(&self, peer_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(peer_id).cloned()
    }

    pub fn active_sessions_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn sessions_by_role(&self, role: Role) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.role == role)
            .cloned()
            .collect()
    }

    /// Exit/hybrid sessions, ordered by fewest active allocations first with
    /// a stable tie-break by peer identifier. Allocation counts are supplied
    /// by the caller (the exit orchestrator owns that bookkeeping) rather
    /// than duplicated here.
    pub fn exit_candidates(&self, allocation_counts: impl Fn(&str) -> usize) -> Vec<Arc<Session>> {
        let mut candidates: Vec<Arc<Session>> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.role.participates_as_exit() && s.is_active())
            .cloned()
            .collect();

        candidates.sort_by(|a, b| {
            allocation_counts(&a.peer_id)
                .cmp(&allocation_counts(&b.peer_id))
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });

        candidates
    }

    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Looks up the active session and enqueues `command` onto its send
    /// channel. Returns `NotFound` if no active session exists for
    /// `peer_id`.
    pub async fn send_command(&self, peer_id: &str, command: Command) -> Result<()> {
        let session = self
            .get(peer_id)
            .ok_or_else(|| Error::not_found(format!("no active session for peer_id={peer_id}")))?;

        self.stats.commands_dispatched_total.fetch_add(1, Ordering::Relaxed);
        session.record_command_issued();

        let message = ControlMessage {
            message_id: command.command_id.clone(),
            timestamp: now_millis(),
            payload: Some(Payload::Command(command)),
        };

        session.send(message).await
    }

    /// Dispatches `command` to `peer_id` and awaits the matching
    /// `CommandResponse` up to `timeout`.
    pub async fn send_command_and_wait(
        &self,
        peer_id: &str,
        mut command: Command,
        timeout: Duration,
    ) -> Result<CommandResponse> {
        let session = self
            .get(peer_id)
            .ok_or_else(|| Error::not_found(format!("no active session for peer_id={peer_id}")))?;

        if command.command_id.is_empty() {
            command.command_id = session.next_command_id();
        }

        let waiter = session.register_command_waiter(command.command_id.clone());
        self.send_command(peer_id, command.clone()).await?;

        match tokio::time::timeout(timeout, waiter).await {
            Ok(Ok(response)) => {
                if response.success {
                    self.stats.commands_succeeded_total.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats.commands_failed_total.fetch_add(1, Ordering::Relaxed);
                }
                Ok(response)
            }
            Ok(Err(_)) => {
                self.stats.commands_failed_total.fetch_add(1, Ordering::Relaxed);
                Err(Error::unavailable("command waiter dropped before a response arrived"))
            }
            Err(_) => {
                session.cancel_command_waiter(&command.command_id);
                self.stats.commands_failed_total.fetch_add(1, Ordering::Relaxed);
                Err(Error::timeout(format!(
                    "no response for command_id={} within {:?}",
                    command.command_id, timeout
                )))
            }
        }
    }

    pub fn commands_dispatched_total(&self) -> u64 {
        self.stats.commands_dispatched_total.load(Ordering::Relaxed)
    }

    pub fn commands_succeeded_total(&self) -> u64 {
        self.stats.commands_succeeded_total.load(Ordering::Relaxed)
    }

    pub fn commands_failed_total(&self) -> u64 {
        self.stats.commands_failed_total.load(Ordering::Relaxed)
    }

    /// Marks inactive and removes any session whose heartbeat is older than
    /// the configured stale timeout, closing its transport via
    /// cancellation. Returns the evicted peer ids.
    pub fn sweep_stale(&self) -> Vec<String> {
        let stale: Vec<String> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.heartbeat_age() > self.stale_timeout)
            .map(|s| s.peer_id.clone())
            .collect();

        for peer_id in &stale {
            self.unregister(peer_id);
            log::info!("evicted stale session peer_id={peer_id}");
        }

        stale
    }

    /// Runs the periodic sweep loop until `cancellation` fires.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, cancellation: tokio_util::sync::CancellationToken) {
        let mut ticker = tokio::time::interval_at(TokioInstant::now() + interval, interval);

        loop {
            tokio::select! {
                _ = cancellation.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_stale();
                }
            }
        }
    }
}

pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub fn unwrap_command_type(kind: i32) -> CommandType {
    CommandType::try_from(kind).unwrap_or(CommandType::CommandTypeUnspecified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::AuthKey;
    use tokio_util::sync::CancellationToken;

    fn new_session(peer_id: &str, role: Role) -> Arc<Session> {
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        Arc::new(Session::new(
            peer_id.to_string(),
            role,
            "r1".to_string(),
            format!("sess-{peer_id}"),
            AuthKey("pk".to_string()),
            tx,
            CancellationToken::new(),
        ))
    }

    #[test]
    fn register_evicts_prior_active_session_for_same_peer_id() {
        let manager = StreamManager::default();
        let first = new_session("p1", Role::Client);
        manager.register(first.clone());
        assert!(first.is_active());
        assert_eq!(manager.active_sessions_count(), 1);

        let second = new_session("p1", Role::Client);
        manager.register(second.clone());

        assert!(!first.is_active());
        assert!(second.is_active());
        assert_eq!(manager.active_sessions_count(), 1);
        assert_eq!(manager.get("p1").unwrap().session_id, second.session_id);
    }

    #[test]
    fn unregister_is_idempotent_on_absent_peer() {
        let manager = StreamManager::default();
        manager.unregister("ghost");
        assert_eq!(manager.active_sessions_count(), 0);
    }

    #[test]
    fn sweep_stale_evicts_only_sessions_past_timeout_and_closes_transport() {
        let manager = StreamManager::new(Duration::from_millis(0));
        let session = new_session("p1", Role::Client);
        manager.register(session.clone());

        std::thread::sleep(Duration::from_millis(5));
        let evicted = manager.sweep_stale();

        assert_eq!(evicted, vec!["p1".to_string()]);
        assert_eq!(manager.active_sessions_count(), 0);
        assert!(session.cancellation().is_cancelled());
    }

    #[test]
    fn sweep_stale_leaves_fresh_sessions_alone() {
        let manager = StreamManager::new(Duration::from_secs(120));
        let session = new_session("p1", Role::Client);
        manager.register(session);

        assert!(manager.sweep_stale().is_empty());
        assert_eq!(manager.active_sessions_count(), 1);
    }

    #[test]
    fn exit_candidates_filters_role_and_orders_by_load_then_peer_id() {
        let manager = StreamManager::default();
        manager.register(new_session("client-1", Role::Client));
        manager.register(new_session("exit-b", Role::Exit));
        manager.register(new_session("exit-a", Role::Hybrid));
        manager.register(new_session("exit-c", Role::Exit));

        let loads: ahash::HashMap<&str, usize> =
            [("exit-a", 2usize), ("exit-b", 0), ("exit-c", 0)].into_iter().collect();

        let candidates = manager.exit_candidates(|peer_id| loads.get(peer_id).copied().unwrap_or(0));
        let ids: Vec<&str> = candidates.iter().map(|s| s.peer_id.as_str()).collect();

        // exit-b and exit-c tie on load=0 and break by peer_id; exit-a trails
        // with load=2. client-1 never appears (wrong role).
        assert_eq!(ids, vec!["exit-b", "exit-c", "exit-a"]);
    }

    #[tokio::test]
    async fn send_command_returns_not_found_without_active_session() {
        let manager = StreamManager::default();
        let err = manager
            .send_command(
                "ghost",
                Command { command_id: "c1".into(), r#type: CommandType::Disconnect as i32, payload: Default::default() },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn send_command_and_wait_times_out_without_a_response() {
        let manager = StreamManager::default();
        manager.register(new_session("p1", Role::Exit));

        let result = manager
            .send_command_and_wait(
                "p1",
                Command { command_id: "c1".into(), r#type: CommandType::SetupExit as i32, payload: Default::default() },
                Duration::from_millis(20),
            )
            .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(manager.commands_failed_total(), 1);
    }

    #[tokio::test]
    async fn send_command_and_wait_resolves_on_matching_response() {
        let manager = Arc::new(StreamManager::default());
        let session = new_session("p1", Role::Exit);
        manager.register(session.clone());

        let waiting = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .send_command_and_wait(
                        "p1",
                        Command { command_id: "".into(), r#type: CommandType::SetupExit as i32, payload: Default::default() },
                        Duration::from_secs(5),
                    )
                    .await
            })
        };

        // Give the spawned task a chance to register its command id (minted
        // internally since we passed an empty one) before resolving it from
        // "the handler side".
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.resolve_command_response(CommandResponse {
            command_id: format!("{}-1", session.session_id),
            success: true,
            message: "ok".into(),
            result: Default::default(),
        });

        let response = waiting.await.unwrap().unwrap();
        assert!(response.success);
        assert_eq!(manager.commands_succeeded_total(), 1);
    }
}
