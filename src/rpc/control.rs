//! The `Control` service: one bidirectional stream per authenticated peer
//! (spec §4.3, component C3's wire-facing half). Everything past the
//! authentication handshake is owned by [`control::Session`] and
//! [`control::StreamManager`] — this module only turns inbound frames into
//! calls on those types and turns their outbound frames into the stream
//! tonic hands back to the client.

use std::{collections::HashMap, pin::Pin, sync::Arc};

use control::{
    ExitOrchestrator, NatHint,
    command,
    nonce::REPLAY_WINDOW,
    session::{AuthKey, Role, Session},
    stream_manager::{StreamManager, now_millis},
};
use proto::{
    crypto::verify_auth,
    proto::{
        AuthRequest, AuthResponse, Command, CommandResponse, CommandType, InfoRequest, InfoResponse, PingRequest, PongResponse,
        control_message::Payload,
        control_server::{Control, ControlServer},
    },
};
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt, wrappers::ReceiverStream};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};

type ProtoControlMessage = proto::proto::ControlMessage;
const OUTBOUND_CHANNEL_CAPACITY: usize = 32;

pub struct ControlService {
    stream_manager: Arc<StreamManager>,
    orchestrator: Arc<ExitOrchestrator>,
    coordinator_id: String,
}

impl ControlService {
    pub fn new(stream_manager: Arc<StreamManager>, orchestrator: Arc<ExitOrchestrator>, coordinator_id: String) -> Self {
        Self { stream_manager, orchestrator, coordinator_id }
    }

    pub fn into_server(self) -> ControlServer<Self> {
        ControlServer::new(self)
    }
}

type ControlMessageStream = Pin<Box<dyn Stream<Item = Result<ProtoControlMessage, Status>> + Send + 'static>>;

#[tonic::async_trait]
impl Control for ControlService {
    type StreamStream = ControlMessageStream;

    async fn stream(&self, request: Request<Streaming<ProtoControlMessage>>) -> Result<Response<Self::StreamStream>, Status> {
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);

        let stream_manager = self.stream_manager.clone();
        let orchestrator = self.orchestrator.clone();
        let coordinator_id = self.coordinator_id.clone();
        tokio::spawn(run_session(inbound, tx, stream_manager, orchestrator, coordinator_id));

        let outbound = ReceiverStream::new(rx).map(Ok);
        Ok(Response::new(Box::pin(outbound)))
    }
}

/// Drives one peer's stream from the first frame (which MUST be an
/// `AuthRequest`, spec §4.3) through to disconnection. Never panics on
/// malformed input: every failure path replies with an `AuthResponse{success:
/// false}` or simply closes the stream.
async fn run_session(
    mut inbound: Streaming<ProtoControlMessage>,
    tx: mpsc::Sender<ProtoControlMessage>,
    stream_manager: Arc<StreamManager>,
    orchestrator: Arc<ExitOrchestrator>,
    coordinator_id: String,
) {
    let first = match inbound.message().await {
        Ok(Some(message)) => message,
        Ok(None) => return,
        Err(status) => {
            log::warn!("control stream closed before first frame: {status}");
            return;
        }
    };

    let Some(Payload::AuthRequest(auth)) = first.payload else {
        let _ = tx.send(deny("first frame on a new stream must be an AuthRequest")).await;
        return;
    };

    let Some(role) = decode_role(auth.role) else {
        stream_manager.record_auth_failure();
        let _ = tx.send(deny("missing or unspecified role")).await;
        return;
    };

    if auth.peer_id.is_empty() {
        stream_manager.record_auth_failure();
        let _ = tx.send(deny("peer_id must not be empty")).await;
        return;
    }

    if !stream_manager.check_and_remember_nonce(&auth.peer_id, &auth.nonce_b64) {
        stream_manager.record_auth_failure();
        let _ = tx
            .send(deny(&format!(
                "nonce already used or outside the {:?} replay window",
                REPLAY_WINDOW
            )))
            .await;
        return;
    }

    if let Err(e) = verify_auth(&auth.peer_id, role.as_str(), &auth.region, &auth.nonce_b64, &auth.public_key_b64, &auth.signature_b64) {
        stream_manager.record_auth_failure();
        let _ = tx.send(deny(&format!("signature verification failed: {e}"))).await;
        return;
    }

    let session_id = format!("{coordinator_id}-{}-{:016x}", auth.peer_id, rand::random::<u64>());
    let session = Arc::new(Session::new(
        auth.peer_id.clone(),
        role,
        auth.region.clone(),
        session_id.clone(),
        AuthKey(auth.public_key_b64.clone()),
        tx.clone(),
        CancellationToken::new(),
    ));

    let ack = ProtoControlMessage {
        message_id: String::new(),
        timestamp: now_millis(),
        payload: Some(Payload::AuthResponse(AuthResponse { success: true, message: String::new(), session_id: session_id.clone() })),
    };

    if session.send(ack).await.is_err() {
        return;
    }

    stream_manager.register(session.clone());
    log::info!("peer_id={} authenticated role={} session_id={session_id}", session.peer_id, session.role);

    loop {
        tokio::select! {
            _ = session.cancellation().cancelled() => {
                log::info!("peer_id={} session cancelled (superseded or evicted)", session.peer_id);
                break;
            }
            frame = inbound.message() => {
                match frame {
                    Ok(Some(message)) => {
                        session.note_inbound();
                        session.touch_heartbeat();
                        handle_frame(&session, &orchestrator, message).await;
                    }
                    Ok(None) => {
                        log::info!("peer_id={} control stream closed by peer", session.peer_id);
                        break;
                    }
                    Err(status) => {
                        log::warn!("peer_id={} control stream error: {status}", session.peer_id);
                        break;
                    }
                }
            }
        }
    }

    stream_manager.unregister(&session.peer_id);
}

async fn handle_frame(session: &Arc<Session>, orchestrator: &Arc<ExitOrchestrator>, message: ProtoControlMessage) {
    match message.payload {
        Some(Payload::PingRequest(ping)) => {
            let server_recv_ms = now_millis();
            session.set_latency_estimate_ms(server_recv_ms - ping.timestamp_ms);
            if session.send(pong(session, &ping)).await.is_err() {
                log::warn!("peer_id={} could not send PongResponse", session.peer_id);
            }
        }
        Some(Payload::CommandResponse(response)) => {
            session.resolve_command_response(response);
        }
        Some(Payload::InfoRequest(request)) => {
            if session.send(info_response(session, &request)).await.is_err() {
                log::warn!("peer_id={} could not send InfoResponse", session.peer_id);
            }
        }
        Some(Payload::Command(request)) if request.r#type == CommandType::RequestExit as i32 => {
            let response = handle_request_exit(session, orchestrator, request).await;
            if session.send(response).await.is_err() {
                log::warn!("peer_id={} could not send CommandResponse for REQUEST_EXIT", session.peer_id);
            }
        }
        // Every other Command kind is coordinator-issued only; a peer
        // sending one here is logged and ignored (spec §4.3 "Any other
        // kind -> logged and ignored").
        Some(_) | None => {}
    }
}

/// Handles a peer-initiated `REQUEST_EXIT` (spec §2 data flow, §4.5
/// `request_exit`). Replies with the allocation outcome directly in the
/// `CommandResponse`; on success also drives the tunnel parameters down as
/// a `ROTATE_PEER` (or `RELAY_SETUP`) command, matching the delivery path
/// already used for commands issued by a *remote* coordinator's walk.
async fn handle_request_exit(session: &Arc<Session>, orchestrator: &Arc<ExitOrchestrator>, request: Command) -> ProtoControlMessage {
    let Some((target_region, prefer_relay)) = command::parse_request_exit(&request.payload) else {
        return command_response(&request.command_id, false, "missing target_region", HashMap::new());
    };

    let hint = NatHint { prefer_relay: Some(prefer_relay), prior_direct_connect_succeeded: None };

    match orchestrator.request_exit(&session.peer_id, target_region, &hint).await {
        Ok(grant) => {
            let mut result = HashMap::new();
            result.insert("allocation_id".to_string(), grant.allocation_id.clone());
            result.insert("endpoint".to_string(), grant.exit_endpoint.clone());
            result.insert("public_key".to_string(), grant.exit_public_key.clone());
            result.insert("allowed_ips".to_string(), grant.allowed_addrs.join(","));

            let mut rotate = command::rotate_peer(&grant.exit_endpoint, &grant.exit_public_key, &grant.allowed_addrs.join(","), &grant.allocation_id);
            rotate.command_id = session.next_command_id();
            if session.send(to_control_message(rotate)).await.is_err() {
                log::warn!("peer_id={} could not deliver ROTATE_PEER for allocation_id={}", session.peer_id, grant.allocation_id);
            }

            command_response(&request.command_id, true, "", result)
        }
        Err(e) => command_response(&request.command_id, false, e.to_string(), HashMap::new()),
    }
}

fn command_response(command_id: &str, success: bool, message: impl Into<String>, result: HashMap<String, String>) -> ProtoControlMessage {
    ProtoControlMessage {
        message_id: String::new(),
        timestamp: now_millis(),
        payload: Some(Payload::CommandResponse(CommandResponse {
            command_id: command_id.to_string(),
            success,
            message: message.into(),
            result,
        })),
    }
}

fn to_control_message(command: Command) -> ProtoControlMessage {
    ProtoControlMessage { message_id: command.command_id.clone(), timestamp: now_millis(), payload: Some(Payload::Command(command)) }
}

fn pong(session: &Session, ping: &PingRequest) -> ProtoControlMessage {
    ProtoControlMessage {
        message_id: String::new(),
        timestamp: now_millis(),
        payload: Some(Payload::PongResponse(PongResponse {
            timestamp_ms: now_millis(),
            original_timestamp_ms: ping.timestamp_ms,
            peer_id: session.peer_id.clone(),
        })),
    }
}

fn info_response(session: &Session, request: &InfoRequest) -> ProtoControlMessage {
    let mut info = std::collections::HashMap::new();
    for field in &request.requested_fields {
        let value = match field.as_str() {
            "role" => session.role.as_str().to_string(),
            "region" => session.region.clone(),
            "session_id" => session.session_id.clone(),
            "latency_estimate_ms" => session.latency_estimate_ms().to_string(),
            "messages_in" => session.messages_in().to_string(),
            "messages_out" => session.messages_out().to_string(),
            "commands_issued" => session.commands_issued().to_string(),
            "commands_failed" => session.commands_failed().to_string(),
            _ => continue,
        };
        info.insert(field.clone(), value);
    }

    ProtoControlMessage {
        message_id: String::new(),
        timestamp: now_millis(),
        payload: Some(Payload::InfoResponse(InfoResponse { peer_id: session.peer_id.clone(), info })),
    }
}

fn deny(message: &str) -> ProtoControlMessage {
    ProtoControlMessage {
        message_id: String::new(),
        timestamp: now_millis(),
        payload: Some(Payload::AuthResponse(AuthResponse { success: false, message: message.to_string(), session_id: String::new() })),
    }
}

fn decode_role(wire_role: i32) -> Option<Role> {
    proto::proto::Role::try_from(wire_role).ok().and_then(Option::<Role>::from)
}
