//! Direkter TCP-Signaling-Kanal
//!
//! Wird verwendet, wenn die Raum-ID eine IP-Adresse ist. Nachrichten sind
//! zeilengetrenntes JSON (`PeerMessage`). Bei einer unspezifizierten Adresse
//! (`0.0.0.0`) wartet der Client auf einen Peer und wird Initiator, sonst
//! verbindet er sich und antwortet.

use super::channel::{dispatch_peer_message, SignalingChannel, SignalingError, SignalingEvents};
use super::messages::*;
use crate::config::RoomConnectionParameters;
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum LinkState {
    #[default]
    New,
    Waiting,
    Connected,
    Closed,
}

/// Signaling über eine direkte TCP-Verbindung
pub struct DirectSignalingClient {
    events: Arc<dyn SignalingEvents>,
    state: Arc<RwLock<LinkState>>,
    tx: Arc<Mutex<Option<mpsc::Sender<String>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DirectSignalingClient {
    pub fn new(events: Arc<dyn SignalingEvents>) -> Self {
        Self {
            events,
            state: Arc::new(RwLock::new(LinkState::New)),
            tx: Arc::new(Mutex::new(None)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.state.read() == LinkState::Connected
    }

    async fn run_link(
        addr: SocketAddr,
        room_id: String,
        events: Arc<dyn SignalingEvents>,
        state: Arc<RwLock<LinkState>>,
        outbox: Arc<Mutex<Option<mpsc::Sender<String>>>>,
    ) {
        let is_server = addr.ip().is_unspecified();

        let stream = if is_server {
            tracing::info!("Waiting for direct peer on {}", addr);
            match TcpListener::bind(addr).await {
                Ok(listener) => listener.accept().await.map(|(stream, peer)| {
                    tracing::info!("Direct peer connected from {}", peer);
                    stream
                }),
                Err(e) => Err(e),
            }
        } else {
            tracing::info!("Connecting to direct peer {}", addr);
            TcpStream::connect(addr).await
        };

        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                *state.write() = LinkState::Closed;
                events.on_channel_error(SignalingError::ConnectionFailed(e.to_string()).to_string());
                return;
            }
        };

        {
            let mut s = state.write();
            if *s == LinkState::Closed {
                return;
            }
            *s = LinkState::Connected;
        }

        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<String>(100);
        *outbox.lock() = Some(tx);

        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(e) = write_half.write_all(line.as_bytes()).await {
                    tracing::error!("Failed to write to direct peer: {}", e);
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        events.on_connected_to_room(SignalingParameters {
            initiator: is_server,
            client_id: String::new(),
            room_id,
            offer_sdp: None,
            ice_candidates: Vec::new(),
            ice_servers: Vec::new(),
        });

        let mut lines = BufReader::new(read_half).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<PeerMessage>(&line) {
                        Ok(message) => dispatch_peer_message(message, events.as_ref()),
                        Err(_) => {
                            events.on_channel_error(
                                SignalingError::UnexpectedMessage(line).to_string(),
                            );
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Direct link read error: {}", e);
                    break;
                }
            }
        }

        let was_open = {
            let mut s = state.write();
            let was_open = *s != LinkState::Closed;
            *s = LinkState::Closed;
            was_open
        };
        outbox.lock().take();
        if was_open {
            events.on_channel_close();
        }
    }

    fn send_message(&self, kind: &'static str, message: &PeerMessage) -> Result<(), SignalingError> {
        let tx = self
            .tx
            .lock()
            .clone()
            .filter(|_| self.is_connected())
            .ok_or(SignalingError::NotConnected(kind))?;

        let mut line =
            serde_json::to_string(message).map_err(|e| SignalingError::SendFailed(e.to_string()))?;
        line.push('\n');

        tx.try_send(line)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    fn send_or_report(&self, kind: &'static str, message: PeerMessage) {
        if let Err(e) = self.send_message(kind, &message) {
            tracing::error!("Failed to send {}: {}", kind, e);
            self.events.on_channel_error(e.to_string());
        }
    }
}

impl SignalingChannel for DirectSignalingClient {
    fn connect_to_room(&self, params: RoomConnectionParameters) {
        let Some(addr) = params.direct_address() else {
            self.events.on_channel_error(
                SignalingError::ConnectionFailed(format!(
                    "room id '{}' is not an IP address",
                    params.room_id
                ))
                .to_string(),
            );
            return;
        };

        {
            let mut s = self.state.write();
            if *s != LinkState::New {
                tracing::warn!("connect_to_room called twice, ignoring");
                return;
            }
            *s = LinkState::Waiting;
        }

        let handle = tokio::spawn(Self::run_link(
            addr,
            params.room_id,
            Arc::clone(&self.events),
            Arc::clone(&self.state),
            Arc::clone(&self.tx),
        ));
        self.tasks.lock().push(handle);
    }

    fn send_offer_sdp(&self, desc: SessionDescription) {
        self.send_or_report("offer SDP", PeerMessage::from_description(&desc));
    }

    fn send_answer_sdp(&self, desc: SessionDescription) {
        self.send_or_report("answer SDP", PeerMessage::from_description(&desc));
    }

    fn send_local_ice_candidate(&self, candidate: IceCandidate) {
        self.send_or_report("ICE candidate", PeerMessage::Candidate(candidate));
    }

    fn send_local_ice_candidate_removals(&self, candidates: Vec<IceCandidate>) {
        self.send_or_report(
            "ICE candidate removals",
            PeerMessage::RemoveCandidates { candidates },
        );
    }

    fn disconnect_from_room(&self) {
        let was_connected = {
            let mut s = self.state.write();
            let was_connected = *s == LinkState::Connected;
            *s = LinkState::Closed;
            was_connected
        };

        if let Some(tx) = self.tx.lock().take() {
            if was_connected {
                if let Ok(mut line) = serde_json::to_string(&PeerMessage::Bye) {
                    line.push('\n');
                    let _ = tx.try_send(line);
                }
            }
        }

        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for DirectSignalingClient {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
