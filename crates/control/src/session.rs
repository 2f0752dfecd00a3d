use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
    time::{Duration, Instant},
};

use ahash::HashMap;
use parking_lot::Mutex;
use proto::proto::ControlMessage;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Closed-set role tag. Role is data, not type: never subclass Session per
/// role, filter on this field instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Exit,
    Hybrid,
}

impl Role {
    pub fn participates_as_exit(self) -> bool {
        matches!(self, Self::Exit | Self::Hybrid)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Exit => "exit",
            Self::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "client" => Ok(Self::Client),
            "exit" => Ok(Self::Exit),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(Error::invalid_argument(format!("unknown role: {other}"))),
        }
    }
}

impl From<proto::proto::Role> for Option<Role> {
    fn from(value: proto::proto::Role) -> Self {
        match value {
            proto::proto::Role::Client => Some(Role::Client),
            proto::proto::Role::Exit => Some(Role::Exit),
            proto::proto::Role::Hybrid => Some(Role::Hybrid),
            proto::proto::Role::RoleUnspecified => None,
        }
    }
}

/// Ed25519 verification key announced in `AuthRequest`, used only to check
/// the signature over the authentication payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuthKey(pub String);

/// Public key used to configure this peer as a WireGuard tunnel peer.
/// Kept distinct from [`AuthKey`]: a deployment may configure the two equal,
/// but this crate never assumes it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelKey(pub String);

#[derive(Default)]
struct Counters {
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    commands_issued: AtomicU64,
    commands_failed: AtomicU64,
}

/// One authenticated peer stream.
///
/// All outbound frames MUST go through [`Session::send`] — it is the only
/// handle onto the per-session send channel, and that channel is the single
/// logical outbound queue that per-peer ordering depends on.
pub struct Session {
    pub peer_id: String,
    pub role: Role,
    pub region: String,
    pub session_id: String,
    pub auth_key: AuthKey,
    tunnel_key: Mutex<Option<TunnelKey>>,
    last_heartbeat: Mutex<Instant>,
    latency_estimate_ms: AtomicI64,
    active: AtomicBool,
    counters: Counters,
    sender: mpsc::Sender<ControlMessage>,
    cancellation: CancellationToken,
    command_waiters: Mutex<HashMap<String, oneshot::Sender<proto::proto::CommandResponse>>>,
    next_command_seq: AtomicU64,
}

impl Session {
    pub fn new(
        peer_id: String,
        role: Role,
        region: String,
        session_id: String,
        auth_key: AuthKey,
        sender: mpsc::Sender<ControlMessage>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            peer_id,
            role,
            region,
            session_id,
            auth_key,
            tunnel_key: Mutex::new(None),
            last_heartbeat: Mutex::new(Instant::now()),
            latency_estimate_ms: AtomicI64::new(0),
            active: AtomicBool::new(true),
            counters: Counters::default(),
            sender,
            cancellation,
            command_waiters: Mutex::new(HashMap::default()),
            next_command_seq: AtomicU64::new(1),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn mark_inactive(&self) {
        self.active.store(false, Ordering::Release);
        self.cancellation.cancel();
    }

    pub fn tunnel_key(&self) -> Option<TunnelKey> {
        self.tunnel_key.lock().clone()
    }

    pub fn set_tunnel_key(&self, key: TunnelKey) {
        *self.tunnel_key.lock() = Some(key);
    }

    pub fn touch_heartbeat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    pub fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }

    pub fn set_latency_estimate_ms(&self, value: i64) {
        self.latency_estimate_ms.store(value, Ordering::Relaxed);
    }

    pub fn latency_estimate_ms(&self) -> i64 {
        self.latency_estimate_ms.load(Ordering::Relaxed)
    }

    pub fn messages_in(&self) -> u64 {
        self.counters.messages_in.load(Ordering::Relaxed)
    }

    pub fn messages_out(&self) -> u64 {
        self.counters.messages_out.load(Ordering::Relaxed)
    }

    pub fn commands_issued(&self) -> u64 {
        self.counters.commands_issued.load(Ordering::Relaxed)
    }

    pub fn commands_failed(&self) -> u64 {
        self.counters.commands_failed.load(Ordering::Relaxed)
    }

    pub(crate) fn record_message_in(&self) {
        self.counters.messages_in.fetch_add(1, Ordering::Relaxed);
    }

    /// Public wrapper around [`Self::record_message_in`] for callers outside
    /// this crate (the coordinator binary's gRPC service layer) that sit on
    /// the inbound frame path but don't otherwise need crate-internal access.
    pub fn note_inbound(&self) {
        self.record_message_in();
    }

    pub(crate) fn record_command_issued(&self) {
        self.counters.commands_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_command_failed(&self) {
        self.counters.commands_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Generates the next coordinator-unique, monotonically non-decreasing
    /// command id for this session.
    pub fn next_command_id(&self) -> String {
        let seq = self.next_command_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.session_id, seq)
    }

    /// Enqueues a frame onto the per-session send channel. This is the only
    /// writer path; callers MUST NOT hold any other reference to the
    /// underlying transport sink.
    pub async fn send(&self, message: ControlMessage) -> Result<()> {
        self.counters.messages_out.fetch_add(1, Ordering::Relaxed);
        self.sender
            .send(message)
            .await
            .map_err(|_| Error::unavailable("session send channel closed"))
    }

    /// Registers a waiter for a `CommandResponse` with the given command id,
    /// used by the exit orchestrator's synchronous-looking `send_command`.
    pub fn register_command_waiter(
        &self,
        command_id: String,
    ) -> oneshot::Receiver<proto::proto::CommandResponse> {
        let (tx, rx) = oneshot::channel();
        self.command_waiters.lock().insert(command_id, tx);
        rx
    }

    pub fn cancel_command_waiter(&self, command_id: &str) {
        self.command_waiters.lock().remove(command_id);
    }

    /// Routes an inbound `CommandResponse` to its waiter, if any is still
    /// registered; otherwise it is logged and dropped.
    pub fn resolve_command_response(&self, response: proto::proto::CommandResponse) {
        if !response.success {
            self.record_command_failed();
        }

        let waiter = self.command_waiters.lock().remove(&response.command_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => {
                log::debug!(
                    "command response for unknown or already-resolved command_id={} peer_id={}",
                    response.command_id,
                    self.peer_id
                );
            }
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn new_session(peer_id: &str) -> (Arc<Session>, mpsc::Receiver<ControlMessage>) {
        let (tx, rx) = mpsc::channel(8);
        let session = Arc::new(Session::new(
            peer_id.to_string(),
            Role::Client,
            "r1".to_string(),
            "sess-1".to_string(),
            AuthKey("pk".to_string()),
            tx,
            CancellationToken::new(),
        ));
        (session, rx)
    }

    #[test]
    fn role_round_trips_through_str() {
        for role in [Role::Client, Role::Exit, Role::Hybrid] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("bogus".parse::<Role>().is_err());
    }

    #[test]
    fn participates_as_exit_only_for_exit_and_hybrid() {
        assert!(!Role::Client.participates_as_exit());
        assert!(Role::Exit.participates_as_exit());
        assert!(Role::Hybrid.participates_as_exit());
    }

    #[tokio::test]
    async fn mark_inactive_cancels_and_flips_flag() {
        let (session, _rx) = new_session("p1");
        assert!(session.is_active());
        session.mark_inactive();
        assert!(!session.is_active());
        assert!(session.cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn send_increments_messages_out_and_reaches_receiver() {
        let (session, mut rx) = new_session("p1");
        let message = ControlMessage { message_id: "m1".into(), timestamp: 0, payload: None };
        session.send(message).await.unwrap();
        assert_eq!(session.messages_out(), 1);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn command_waiter_resolves_exactly_once() {
        let (session, _rx) = new_session("p1");
        let rx = session.register_command_waiter("c1".to_string());

        session.resolve_command_response(proto::proto::CommandResponse {
            command_id: "c1".into(),
            success: true,
            message: "ok".into(),
            result: Default::default(),
        });

        let response = rx.await.unwrap();
        assert_eq!(response.command_id, "c1");
        assert!(response.success);
        // A second response for the same id has no waiter left to resolve; it
        // must not panic and must be observable only via the failed counter.
        session.resolve_command_response(proto::proto::CommandResponse {
            command_id: "c1".into(),
            success: false,
            message: "late".into(),
            result: Default::default(),
        });
        assert_eq!(session.commands_failed(), 1);
    }

    #[test]
    fn next_command_id_is_monotonically_non_decreasing() {
        let (session, _rx) = new_session("p1");
        let a = session.next_command_id();
        let b = session.next_command_id();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn tunnel_key_defaults_to_none_and_can_be_set() {
        let (session, _rx) = new_session("p1");
        assert!(session.tunnel_key().is_none());
        session.set_tunnel_key(TunnelKey("tk".to_string()));
        assert_eq!(session.tunnel_key(), Some(TunnelKey("tk".to_string())));
    }
}
