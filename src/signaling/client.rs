//! WebSocket Client für den Raum-Server
//!
//! Verwaltet die WebSocket-Verbindung zum Signaling-Server:
//! - Raum betreten und Signaling-Parameter empfangen
//! - Offer/Answer/Candidates an den anderen Peer weiterleiten
//! - Heartbeat-Keeping
//! - Loopback-Modus (eigenes Offer kommt als Answer zurück)

use super::channel::{dispatch_peer_message, SignalingChannel, SignalingError, SignalingEvents};
use super::messages::*;
use crate::config::RoomConnectionParameters;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum RoomPhase {
    #[default]
    New,
    Connecting,
    Joined,
    Closed,
}

#[derive(Debug, Clone, Default)]
struct ClientState {
    phase: RoomPhase,
    room_id: String,
    client_id: Option<String>,
    loopback: bool,
}

type Outbox = Arc<Mutex<Option<mpsc::Sender<String>>>>;

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für Signaling-Server Kommunikation
pub struct WebSocketSignalingClient {
    events: Arc<dyn SignalingEvents>,
    state: Arc<RwLock<ClientState>>,
    tx: Outbox,
    heartbeat_interval: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebSocketSignalingClient {
    /// Erstellt einen neuen Client
    pub fn new(events: Arc<dyn SignalingEvents>, heartbeat_interval: Duration) -> Self {
        Self {
            events,
            state: Arc::new(RwLock::new(ClientState::default())),
            tx: Arc::new(Mutex::new(None)),
            heartbeat_interval,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Client-ID, die der Server beim Betreten vergeben hat
    pub fn client_id(&self) -> Option<String> {
        self.state.read().client_id.clone()
    }

    /// Prüft ob der Raum betreten wurde
    pub fn is_joined(&self) -> bool {
        self.state.read().phase == RoomPhase::Joined
    }

    fn is_loopback(&self) -> bool {
        self.state.read().loopback
    }

    /// Verbindet und startet Read-, Write- und Heartbeat-Tasks
    async fn run_connection(
        ws_url: String,
        room_id: String,
        loopback: bool,
        events: Arc<dyn SignalingEvents>,
        state: Arc<RwLock<ClientState>>,
        outbox: Outbox,
        heartbeat_interval: Duration,
    ) {
        tracing::info!("Connecting to signaling server: {}", ws_url);

        let ws_stream = match connect_async(ws_url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                state.write().phase = RoomPhase::Closed;
                events.on_channel_error(SignalingError::ConnectionFailed(e.to_string()).to_string());
                return;
            }
        };

        if state.read().phase == RoomPhase::Closed {
            tracing::debug!("Room left while connecting, dropping WebSocket");
            return;
        }

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<String>(100);

        // Write-Task
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        let join = StampedMessage::now(JoinPayload::new(room_id.clone(), loopback));
        match serde_json::to_string(&join) {
            Ok(text) => {
                if tx.try_send(text).is_err() {
                    events.on_channel_error(
                        SignalingError::SendFailed("join request".to_string()).to_string(),
                    );
                    return;
                }
            }
            Err(e) => {
                events.on_channel_error(SignalingError::SendFailed(e.to_string()).to_string());
                return;
            }
        }
        *outbox.lock() = Some(tx);

        // Heartbeat-Task: endet, sobald der Sender entfernt wurde
        let heartbeat_state = Arc::clone(&state);
        let heartbeat_outbox = Arc::clone(&outbox);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(client_id) = heartbeat_state.read().client_id.clone() else {
                    continue;
                };
                let Some(tx) = heartbeat_outbox.lock().clone() else {
                    tracing::debug!("Heartbeat: client disconnected, stopping heartbeat task");
                    break;
                };
                if let Ok(text) =
                    serde_json::to_string(&StampedMessage::now(HeartbeatPayload::new(client_id)))
                {
                    if let Err(e) = tx.try_send(text) {
                        tracing::warn!("Failed to send heartbeat: {}", e);
                    }
                }
            }
        });

        // Read-Loop
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(server_msg) => {
                        Self::handle_server_message(server_msg, &state, events.as_ref())
                    }
                    Err(e) => tracing::warn!("Ignoring malformed server message: {}", e),
                },
                Ok(Message::Close(_)) => {
                    tracing::info!("WebSocket closed by server");
                    break;
                }
                Err(e) => {
                    tracing::error!("WebSocket error: {}", e);
                    let was_open = {
                        let mut s = state.write();
                        let was_open = s.phase != RoomPhase::Closed;
                        s.phase = RoomPhase::Closed;
                        was_open
                    };
                    outbox.lock().take();
                    if was_open {
                        events.on_channel_error(format!("WebSocket error: {}", e));
                    }
                    return;
                }
                _ => {}
            }
        }

        let was_open = {
            let mut s = state.write();
            let was_open = s.phase != RoomPhase::Closed;
            s.phase = RoomPhase::Closed;
            was_open
        };
        outbox.lock().take();
        if was_open {
            events.on_channel_close();
        }
    }

    /// Verarbeitet eingehende Server-Nachrichten
    fn handle_server_message(
        msg: ServerMessage,
        state: &Arc<RwLock<ClientState>>,
        events: &dyn SignalingEvents,
    ) {
        match msg {
            ServerMessage::Joined {
                client_id,
                is_initiator,
                messages,
                ice_servers,
            } => {
                let room_id = {
                    let mut s = state.write();
                    if s.phase != RoomPhase::Connecting {
                        tracing::warn!("Unexpected join confirmation in phase {:?}", s.phase);
                        return;
                    }
                    s.phase = RoomPhase::Joined;
                    s.client_id = Some(client_id.clone());
                    s.room_id.clone()
                };
                tracing::info!(
                    "Joined room {} as {} (initiator: {})",
                    room_id,
                    client_id,
                    is_initiator
                );
                events.on_connected_to_room(SignalingParameters::from_stored_messages(
                    room_id,
                    client_id,
                    is_initiator,
                    messages,
                    ice_servers,
                ));
            }

            ServerMessage::Relay { message } => {
                if state.read().phase != RoomPhase::Joined {
                    tracing::warn!("Dropping relayed message before room join: {:?}", message);
                    return;
                }
                dispatch_peer_message(message, events);
            }

            ServerMessage::Bye { reason } => {
                tracing::info!("Room closed by server (reason: {:?})", reason);
                state.write().phase = RoomPhase::Closed;
                events.on_channel_close();
            }

            ServerMessage::Error { code, message } => {
                tracing::error!("Server error {}: {}", code, message);
                events.on_channel_error(SignalingError::ServerError { code, message }.to_string());
            }

            ServerMessage::Pong { .. } => {
                // Heartbeat-Response - nichts zu tun
            }
        }
    }

    /// Sendet eine Peer-Nachricht über den Server (non-blocking)
    fn send_relay(&self, kind: &'static str, message: PeerMessage) -> Result<(), SignalingError> {
        let (room_id, client_id) = {
            let s = self.state.read();
            match (&s.phase, &s.client_id) {
                (RoomPhase::Joined, Some(client_id)) => (s.room_id.clone(), client_id.clone()),
                _ => return Err(SignalingError::NotConnected(kind)),
            }
        };

        let payload = StampedMessage::now(RelayPayload::new(room_id, client_id, message));
        let text =
            serde_json::to_string(&payload).map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or(SignalingError::NotConnected(kind))?;
        tx.try_send(text)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    fn send_or_report(&self, kind: &'static str, message: PeerMessage) {
        if let Err(e) = self.send_relay(kind, message) {
            tracing::error!("Failed to send {}: {}", kind, e);
            self.events.on_channel_error(e.to_string());
        }
    }
}

impl SignalingChannel for WebSocketSignalingClient {
    fn connect_to_room(&self, params: RoomConnectionParameters) {
        let ws_url = match params.websocket_url() {
            Ok(url) => url.to_string(),
            Err(e) => {
                self.events
                    .on_channel_error(SignalingError::ConnectionFailed(e.to_string()).to_string());
                return;
            }
        };

        {
            let mut s = self.state.write();
            if s.phase != RoomPhase::New {
                tracing::warn!("connect_to_room called twice, ignoring");
                return;
            }
            s.phase = RoomPhase::Connecting;
            s.room_id = params.room_id.clone();
            s.loopback = params.loopback;
        }

        let handle = tokio::spawn(Self::run_connection(
            ws_url,
            params.room_id,
            params.loopback,
            Arc::clone(&self.events),
            Arc::clone(&self.state),
            Arc::clone(&self.tx),
            self.heartbeat_interval,
        ));
        self.tasks.lock().push(handle);
    }

    fn send_offer_sdp(&self, desc: SessionDescription) {
        self.send_or_report("offer SDP", PeerMessage::from_description(&desc));
        if self.is_loopback() {
            // Im Loopback-Modus wird das Offer als Answer zurückgespielt
            self.events
                .on_remote_description(SessionDescription::answer(desc.sdp));
        }
    }

    fn send_answer_sdp(&self, desc: SessionDescription) {
        if self.is_loopback() {
            tracing::error!("Sending answer in loopback mode");
            return;
        }
        self.send_or_report("answer SDP", PeerMessage::from_description(&desc));
    }

    fn send_local_ice_candidate(&self, candidate: IceCandidate) {
        self.send_or_report("ICE candidate", PeerMessage::Candidate(candidate.clone()));
        if self.is_loopback() {
            self.events.on_remote_ice_candidate(candidate);
        }
    }

    fn send_local_ice_candidate_removals(&self, candidates: Vec<IceCandidate>) {
        self.send_or_report(
            "ICE candidate removals",
            PeerMessage::RemoveCandidates {
                candidates: candidates.clone(),
            },
        );
        if self.is_loopback() {
            self.events.on_remote_ice_candidates_removed(candidates);
        }
    }

    fn disconnect_from_room(&self) {
        let leave = {
            let mut s = self.state.write();
            let joined = s.phase == RoomPhase::Joined;
            if s.phase != RoomPhase::Closed {
                tracing::info!("Disconnecting from room {}", s.room_id);
            }
            s.phase = RoomPhase::Closed;
            s.client_id
                .clone()
                .filter(|_| joined)
                .map(|client_id| LeavePayload::new(s.room_id.clone(), client_id))
        };

        // Sender entfernen beendet Write- und Heartbeat-Task
        if let Some(tx) = self.tx.lock().take() {
            if let Some(leave) = leave {
                if let Ok(text) = serde_json::to_string(&StampedMessage::now(leave)) {
                    let _ = tx.try_send(text);
                }
            }
        }

        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for WebSocketSignalingClient {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for WebSocketSignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketSignalingClient")
            .field("state", &*self.state.read())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
