//! The peer's persistent-stream client.
//!
//! Owns exactly one logical connection to one coordinator at a time. The
//! reconnect loop, the reader task, and the heartbeat ticker are independent
//! cooperating tasks; the only thing they share is the outbound
//! `mpsc::Sender` clone handed to each, which is the send channel's single
//! writer-side handle for this connection.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use ahash::HashMap as AHashMap;
use parking_lot::Mutex;
use proto::{
    crypto::{Keypair, generate_nonce_b64},
    proto::{AuthRequest, Command, CommandResponse, CommandType, ControlMessage, PingRequest, control_client::ControlClient, control_message::Payload},
};
use rand::Rng;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Endpoint;

use crate::{
    command_handler::{CommandHandler, HandlerRegistry},
    error::{Error, Result},
    role::Role,
};

/// Timeout for a self-initiated command awaiting its `CommandResponse`
/// (mirrors `control::exit_orchestrator::EXIT_COMMAND_TIMEOUT` on the
/// coordinator side of the same round trip).
pub const REQUEST_EXIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Tunnel parameters a successful `request_exit` hands back: the same
/// `{exit_endpoint, exit_public_key, allowed_addrs, allocation_id}` shape
/// the coordinator's `ExitGrant` returns, from the requester's own point of
/// view.
#[derive(Debug, Clone)]
pub struct ExitGrant {
    pub exit_endpoint: String,
    pub exit_public_key: String,
    pub allowed_addrs: Vec<String>,
    pub allocation_id: String,
}

pub const AUTH_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const HEARTBEAT_MISS_BUDGET: Duration = Duration::from_secs(90);
pub const BACKOFF_INITIAL: Duration = Duration::from_secs(5);
pub const BACKOFF_MAX: Duration = Duration::from_secs(60);
const OUTBOUND_CHANNEL_CAPACITY: usize = 32;

/// Connection state machine: `Disconnected -> Dialing -> Authenticating ->
/// Connected -> Disconnected`, terminal only on an explicit
/// [`PeerStreamClient::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Dialing,
    Authenticating,
    Connected,
}

#[derive(Clone)]
pub struct ClientConfig {
    pub peer_id: String,
    pub region: String,
    pub coordinator_addr: String,
    pub auth_response_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_miss_budget: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Multiplicative jitter ratio applied to each backoff wait (e.g. `0.2`
    /// for +/-20%). `0.0` disables jitter. Worth keeping on once many peers
    /// share a coordinator, to avoid synchronized reconnect storms.
    pub backoff_jitter_ratio: f64,
}

impl ClientConfig {
    pub fn new(peer_id: impl Into<String>, region: impl Into<String>, coordinator_addr: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            region: region.into(),
            coordinator_addr: coordinator_addr.into(),
            auth_response_timeout: AUTH_RESPONSE_TIMEOUT,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_miss_budget: HEARTBEAT_MISS_BUDGET,
            backoff_initial: BACKOFF_INITIAL,
            backoff_max: BACKOFF_MAX,
            backoff_jitter_ratio: 0.2,
        }
    }
}

struct Shared {
    config: ClientConfig,
    keypair: Keypair,
    role: Mutex<Role>,
    registry: Arc<HandlerRegistry>,
    state: Mutex<ConnectionState>,
    session_id: Mutex<Option<String>>,
    latency_estimate_ms: AtomicI64,
    conn_cancel: Mutex<CancellationToken>,
    stop: CancellationToken,
    backoff: Mutex<Duration>,
    /// The current connection's outbound sender, available to callers that
    /// want to push a self-initiated frame (e.g. [`PeerStreamClient::request_exit`])
    /// without going through the reader/heartbeat tasks. `None` while
    /// disconnected.
    active_tx: Mutex<Option<mpsc::Sender<ControlMessage>>>,
    /// Waiters for `CommandResponse`s to commands this client itself issued,
    /// keyed by `command_id` — the peer-side mirror of
    /// `control::Session::command_waiters`.
    command_waiters: Mutex<AHashMap<String, oneshot::Sender<CommandResponse>>>,
    next_command_seq: std::sync::atomic::AtomicU64,
}

/// One instance owns the reconnect loop for one coordinator address;
/// `start()` spawns it, `stop()` tears it down. Command handlers are
/// registered once up front and consulted on every inbound `Command` for
/// the lifetime of the client, across reconnects.
pub struct PeerStreamClient {
    shared: Arc<Shared>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeerStreamClient {
    pub fn new(config: ClientConfig, keypair: Keypair, initial_role: Role) -> Self {
        let backoff_initial = config.backoff_initial;
        let shared = Arc::new(Shared {
            config,
            keypair,
            role: Mutex::new(initial_role),
            registry: Arc::new(HandlerRegistry::new()),
            state: Mutex::new(ConnectionState::Disconnected),
            session_id: Mutex::new(None),
            latency_estimate_ms: AtomicI64::new(0),
            conn_cancel: Mutex::new(CancellationToken::new()),
            stop: CancellationToken::new(),
            backoff: Mutex::new(backoff_initial),
            active_tx: Mutex::new(None),
            command_waiters: Mutex::new(AHashMap::default()),
            next_command_seq: std::sync::atomic::AtomicU64::new(1),
        });

        Self { shared, loop_handle: Mutex::new(None) }
    }

    /// Installs or replaces the handler for `kind`; consulted on every
    /// inbound `Command` from this point on.
    pub fn register_command_handler(&self, kind: CommandType, handler: Arc<dyn CommandHandler>) {
        self.shared.registry.register(kind, handler);
    }

    /// Spawns the reconnect loop and returns immediately.
    pub fn start(&self) {
        let shared = self.shared.clone();
        let handle = tokio::spawn(run_loop(shared));
        *self.loop_handle.lock() = Some(handle);
    }

    /// Requests graceful termination: cancels the in-flight connection,
    /// signals the reconnect loop to stop, and awaits it.
    pub async fn stop(&self) {
        self.shared.stop.cancel();
        self.shared.conn_cancel.lock().cancel();

        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.state.lock() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.session_id.lock().clone()
    }

    pub fn current_latency_estimate_ms(&self) -> i64 {
        self.shared.latency_estimate_ms.load(Ordering::Relaxed)
    }

    pub fn current_role(&self) -> Role {
        *self.shared.role.lock()
    }

    /// Changes the declared role. If currently connected, this cancels the
    /// in-flight connection and resets backoff
    /// to its initial value so the reconnect loop re-dials promptly with
    /// the new role's `AuthRequest` — the old session is not reused.
    pub fn rebind_role(&self, new_role: Role) {
        *self.shared.role.lock() = new_role;
        *self.shared.backoff.lock() = self.shared.config.backoff_initial;
        self.shared.conn_cancel.lock().cancel();
    }

    /// Asks the coordinator for egress in `target_region`. Sends a
    /// `REQUEST_EXIT` command and awaits its matching `CommandResponse` up
    /// to [`REQUEST_EXIT_TIMEOUT`]; on success the coordinator also drives a
    /// `ROTATE_PEER` (or `RELAY_SETUP`) back down this same stream to
    /// actually configure the tunnel, handled separately by whatever
    /// handler this client registered for those kinds.
    pub async fn request_exit(&self, target_region: &str, prefer_relay: Option<bool>) -> Result<ExitGrant> {
        let tx = self
            .shared
            .active_tx
            .lock()
            .clone()
            .ok_or_else(|| Error::unavailable("not connected to a coordinator"))?;

        let command_id = format!("{}-{}", self.shared.config.peer_id, self.shared.next_command_seq.fetch_add(1, Ordering::Relaxed));

        let mut payload = HashMap::new();
        payload.insert("target_region".to_string(), target_region.to_string());
        if let Some(prefer_relay) = prefer_relay {
            payload.insert("prefer_relay".to_string(), prefer_relay.to_string());
        }

        let command = Command { command_id: command_id.clone(), r#type: CommandType::RequestExit as i32, payload };

        let (response_tx, response_rx) = oneshot::channel();
        self.shared.command_waiters.lock().insert(command_id.clone(), response_tx);

        let message = ControlMessage { message_id: command_id.clone(), timestamp: now_millis(), payload: Some(Payload::Command(command)) };
        if tx.send(message).await.is_err() {
            self.shared.command_waiters.lock().remove(&command_id);
            return Err(Error::unavailable("outbound channel closed before REQUEST_EXIT could be sent"));
        }

        let response = match tokio::time::timeout(REQUEST_EXIT_TIMEOUT, response_rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(Error::unavailable("REQUEST_EXIT waiter dropped before a response arrived")),
            Err(_) => {
                self.shared.command_waiters.lock().remove(&command_id);
                return Err(Error::timeout(format!("no response to REQUEST_EXIT within {:?}", REQUEST_EXIT_TIMEOUT)));
            }
        };

        if !response.success {
            return Err(Error::not_found(response.message));
        }

        Ok(ExitGrant {
            exit_endpoint: response.result.get("endpoint").cloned().unwrap_or_default(),
            exit_public_key: response.result.get("public_key").cloned().unwrap_or_default(),
            allowed_addrs: response.result.get("allowed_ips").map(|s| s.split(',').map(str::to_string).collect()).unwrap_or_default(),
            allocation_id: response.result.get("allocation_id").cloned().unwrap_or_default(),
        })
    }
}

async fn run_loop(shared: Arc<Shared>) {
    loop {
        if shared.stop.is_cancelled() {
            break;
        }

        *shared.conn_cancel.lock() = CancellationToken::new();

        match dial_and_authenticate(&shared).await {
            Ok((tx, inbound)) => {
                *shared.backoff.lock() = shared.config.backoff_initial;
                run_connected(shared.clone(), tx, inbound).await;
            }
            Err(e) => {
                log::warn!("peer_id={} dial/auth failed: {e}", shared.config.peer_id);
                *shared.state.lock() = ConnectionState::Disconnected;
            }
        }

        if shared.stop.is_cancelled() {
            break;
        }

        let delay = next_backoff_delay(&shared);
        tokio::select! {
            _ = shared.stop.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    *shared.state.lock() = ConnectionState::Disconnected;
}

/// Returns the delay to sleep before the *next* dial attempt and advances
/// the stored backoff for the attempt after that (spec §4.4 "Reconnect
/// policy": starts at `BackoffInitial`, doubles each consecutive failure up
/// to `BackoffMax`, reset to `BackoffInitial` on successful authentication).
fn next_backoff_delay(shared: &Arc<Shared>) -> Duration {
    let mut backoff = shared.backoff.lock();
    let base = *backoff;
    *backoff = (base * 2).min(shared.config.backoff_max);

    if shared.config.backoff_jitter_ratio <= 0.0 {
        return base;
    }

    let jitter = shared.config.backoff_jitter_ratio;
    let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
    Duration::from_secs_f64((base.as_secs_f64() * factor).max(0.0))
}

async fn dial_and_authenticate(shared: &Arc<Shared>) -> Result<(mpsc::Sender<ControlMessage>, tonic::Streaming<ControlMessage>)> {
    *shared.state.lock() = ConnectionState::Dialing;

    let uri = if shared.config.coordinator_addr.starts_with("http://") || shared.config.coordinator_addr.starts_with("https://") {
        shared.config.coordinator_addr.clone()
    } else {
        format!("http://{}", shared.config.coordinator_addr)
    };

    let channel = Endpoint::from_shared(uri)
        .map_err(|e| Error::invalid_argument(format!("malformed coordinator address: {e}")))?
        .connect()
        .await
        .map_err(|e| Error::unavailable(format!("dial failed: {e}")))?;

    let mut client = ControlClient::new(channel);
    let (tx, rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);

    let role = *shared.role.lock();
    let nonce = generate_nonce_b64();
    let signature = shared.keypair.sign_auth(&shared.config.peer_id, role.as_str(), &shared.config.region, &nonce);

    let auth = ControlMessage {
        message_id: String::new(),
        timestamp: now_millis(),
        payload: Some(Payload::AuthRequest(AuthRequest {
            peer_id: shared.config.peer_id.clone(),
            role: proto::proto::Role::from(role) as i32,
            public_key_b64: shared.keypair.public_key_b64(),
            region: shared.config.region.clone(),
            signature_b64: signature,
            nonce_b64: nonce,
        })),
    };

    tx.send(auth).await.map_err(|_| Error::unavailable("outbound channel closed before AuthRequest could be sent"))?;

    *shared.state.lock() = ConnectionState::Authenticating;

    let response = client
        .stream(ReceiverStream::new(rx))
        .await
        .map_err(|status| Error::unavailable(format!("Stream rpc failed: {status}")))?;

    let mut inbound = response.into_inner();

    let first = tokio::time::timeout(shared.config.auth_response_timeout, inbound.message())
        .await
        .map_err(|_| Error::timeout("no AuthResponse within AuthResponseTimeout"))?
        .map_err(|status| Error::unauthenticated(format!("auth stream closed: {status}")))?
        .ok_or_else(|| Error::unauthenticated("stream closed before AuthResponse arrived"))?;

    let Some(Payload::AuthResponse(ack)) = first.payload else {
        return Err(Error::unauthenticated("first frame from coordinator was not an AuthResponse"));
    };

    if !ack.success {
        return Err(Error::unauthenticated(ack.message));
    }

    *shared.session_id.lock() = Some(ack.session_id);
    Ok((tx, inbound))
}

/// Runs one authenticated connection until it drops, the heartbeat misses
/// its budget, or the caller tears it down. Returns once the connection is
/// fully wound down so `run_loop` can decide whether and how long to wait
/// before redialing.
async fn run_connected(shared: Arc<Shared>, tx: mpsc::Sender<ControlMessage>, mut inbound: tonic::Streaming<ControlMessage>) {
    *shared.state.lock() = ConnectionState::Connected;
    *shared.active_tx.lock() = Some(tx.clone());
    log::info!("peer_id={} connected session_id={:?}", shared.config.peer_id, shared.session_id.lock().clone());

    let conn_cancel = shared.conn_cancel.lock().clone();
    let last_pong = Arc::new(Mutex::new(Instant::now()));

    let reader = tokio::spawn({
        let shared = shared.clone();
        let tx = tx.clone();
        let last_pong = last_pong.clone();
        let cancel = conn_cancel.clone();
        async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = inbound.message() => {
                        match frame {
                            Ok(Some(message)) => handle_inbound(&shared, &tx, &last_pong, message).await,
                            Ok(None) => {
                                log::info!("peer_id={} inbound stream closed by coordinator", shared.config.peer_id);
                                break;
                            }
                            Err(status) => {
                                log::warn!("peer_id={} inbound stream error: {status}", shared.config.peer_id);
                                break;
                            }
                        }
                    }
                }
            }
            cancel.cancel();
        }
    });

    let heartbeat = tokio::spawn({
        let shared = shared.clone();
        let tx = tx.clone();
        let last_pong = last_pong.clone();
        let cancel = conn_cancel.clone();
        async move {
            let mut ticker = tokio::time::interval(shared.config.heartbeat_interval);
            ticker.tick().await; // first tick fires immediately; skip so auth isn't followed by an instant ping
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let ping = ControlMessage {
                            message_id: String::new(),
                            timestamp: now_millis(),
                            payload: Some(Payload::PingRequest(PingRequest {
                                timestamp_ms: now_millis(),
                                peer_id: shared.config.peer_id.clone(),
                            })),
                        };

                        if tx.send(ping).await.is_err() {
                            break;
                        }

                        if last_pong.lock().elapsed() > shared.config.heartbeat_miss_budget {
                            log::warn!("peer_id={} missed heartbeat budget, forcing reconnect", shared.config.peer_id);
                            break;
                        }
                    }
                }
            }
            cancel.cancel();
        }
    });

    tokio::select! {
        _ = conn_cancel.cancelled() => {}
        _ = shared.stop.cancelled() => {}
    }

    conn_cancel.cancel();
    let _ = reader.await;
    let _ = heartbeat.await;

    *shared.active_tx.lock() = None;
    *shared.state.lock() = ConnectionState::Disconnected;
}

async fn handle_inbound(shared: &Arc<Shared>, tx: &mpsc::Sender<ControlMessage>, last_pong: &Arc<Mutex<Instant>>, message: ControlMessage) {
    match message.payload {
        Some(Payload::PongResponse(pong)) => {
            *last_pong.lock() = Instant::now();
            shared.latency_estimate_ms.store(now_millis() - pong.original_timestamp_ms, Ordering::Relaxed);
        }
        Some(Payload::Command(command)) => {
            let command_id = command.command_id.clone();
            let response = shared.registry.dispatch(command).await;
            let reply = ControlMessage { message_id: command_id, timestamp: now_millis(), payload: Some(Payload::CommandResponse(response)) };

            if tx.send(reply).await.is_err() {
                log::warn!("peer_id={} could not send CommandResponse, outbound channel closed", shared.config.peer_id);
            }
        }
        Some(Payload::CommandResponse(response)) => {
            // A response to a command *this client* issued (e.g. REQUEST_EXIT),
            // as opposed to the CommandResponse this client sends upward for
            // commands the coordinator issued to it (handled above).
            let waiter = shared.command_waiters.lock().remove(&response.command_id);
            match waiter {
                Some(waiter) => {
                    let _ = waiter.send(response);
                }
                None => {
                    log::debug!(
                        "peer_id={} CommandResponse for unknown or already-resolved command_id={}",
                        shared.config.peer_id,
                        response.command_id
                    );
                }
            }
        }
        Some(other) => {
            log::debug!("peer_id={} ignoring frame kind not handled on the peer side: {}", shared.config.peer_id, payload_kind_name(&other));
        }
        None => {}
    }
}

fn payload_kind_name(payload: &Payload) -> &'static str {
    match payload {
        Payload::AuthRequest(_) => "AuthRequest",
        Payload::AuthResponse(_) => "AuthResponse",
        Payload::PingRequest(_) => "PingRequest",
        Payload::PongResponse(_) => "PongResponse",
        Payload::Command(_) => "Command",
        Payload::CommandResponse(_) => "CommandResponse",
        Payload::InfoRequest(_) => "InfoRequest",
        Payload::InfoResponse(_) => "InfoResponse",
    }
}

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_at_max() {
        let shared = Arc::new(Shared {
            config: ClientConfig { backoff_jitter_ratio: 0.0, ..ClientConfig::new("p1", "us", "127.0.0.1:1") },
            keypair: Keypair::generate(),
            role: Mutex::new(Role::Client),
            registry: Arc::new(HandlerRegistry::new()),
            state: Mutex::new(ConnectionState::Disconnected),
            session_id: Mutex::new(None),
            latency_estimate_ms: AtomicI64::new(0),
            conn_cancel: Mutex::new(CancellationToken::new()),
            stop: CancellationToken::new(),
            backoff: Mutex::new(Duration::from_secs(5)),
            active_tx: Mutex::new(None),
            command_waiters: Mutex::new(AHashMap::default()),
            next_command_seq: std::sync::atomic::AtomicU64::new(1),
        });

        assert_eq!(next_backoff_delay(&shared), Duration::from_secs(5));
        assert_eq!(next_backoff_delay(&shared), Duration::from_secs(10));
        assert_eq!(next_backoff_delay(&shared), Duration::from_secs(20));
        assert_eq!(next_backoff_delay(&shared), Duration::from_secs(40));
        assert_eq!(next_backoff_delay(&shared), Duration::from_secs(60));
        assert_eq!(next_backoff_delay(&shared), Duration::from_secs(60));
    }

    #[test]
    fn new_client_starts_disconnected_with_configured_role() {
        let config = ClientConfig::new("peer-1", "us", "127.0.0.1:9000");
        let client = PeerStreamClient::new(config, Keypair::generate(), Role::Client);

        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.current_role(), Role::Client);
        assert!(!client.is_connected());
        assert!(client.session_id().is_none());
    }

    #[test]
    fn rebind_role_updates_role_and_resets_backoff() {
        let config = ClientConfig::new("peer-1", "us", "127.0.0.1:9000");
        let client = PeerStreamClient::new(config, Keypair::generate(), Role::Client);

        *client.shared.backoff.lock() = Duration::from_secs(60);
        client.rebind_role(Role::Hybrid);

        assert_eq!(client.current_role(), Role::Hybrid);
        assert_eq!(*client.shared.backoff.lock(), Duration::from_secs(5));
    }
}
