//! Control Queue der Session
//!
//! Drei schmale Sinks schreiben in dieselbe Queue:
//! - `SignalingEventSink` für den Signaling-Kanal
//! - `ConnectionEventSink` für die Media Engine
//! - `SessionHandle` für Benutzeraktionen
//!
//! Nach dem Abbau ist der Empfänger weg und späte Ereignisse werden still
//! verworfen.

use super::error::SessionError;
use super::state::{SessionSnapshot, SessionState};
use crate::media::{CaptureFormat, ConnectionEvents, ScreenCaptureGrant, StatsSnapshot};
use crate::messaging::{ApplicationMessage, CoordinateStream, RouterError, StreamTag};
use crate::signaling::{IceCandidate, SessionDescription, SignalingEvents, SignalingParameters};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

// ============================================================================
// EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    ConnectedToRoom(SignalingParameters),
    RemoteDescription(SessionDescription),
    RemoteIceCandidate(IceCandidate),
    RemoteIceCandidatesRemoved(Vec<IceCandidate>),
    ChannelClose,
    ChannelError(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    LocalDescription(SessionDescription),
    IceCandidate(IceCandidate),
    IceCandidatesRemoved(Vec<IceCandidate>),
    IceConnected,
    IceDisconnected,
    Connected,
    Disconnected,
    ConnectionClosed,
    StatsReady(StatsSnapshot),
    ApplicationMessage(ApplicationMessage),
    Error(String),
    CaptureError(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum UserAction {
    StartCall {
        screen_grant: Option<ScreenCaptureGrant>,
    },
    HangUp,
    ToggleMic,
    SwitchCamera,
    ChangeCaptureFormat(CaptureFormat),
    /// Host ist im Hintergrund
    PauseVideo,
    ResumeVideo,
    SwapFeeds,
    SendText(String),
    SendScore(String),
    SendCoordinates(CoordinateStream, Vec<f32>),
    AcknowledgeError,
    /// Prozess wird beendet
    Shutdown,
}

/// Alles, was der Orchestrator verarbeitet
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Signaling(SignalingEvent),
    Connection(ConnectionEvent),
    User(UserAction),
}

/// Was Beobachter über die Session erfahren
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotification {
    StateChanged(SessionState),
    Stats(StatsSnapshot),
    Error(SessionError),
    MicrophoneEnabled(bool),
    SendRejected { stream: StreamTag, reason: RouterError },
}

pub(crate) type ControlSender = mpsc::UnboundedSender<SessionEvent>;

fn post(tx: &ControlSender, event: SessionEvent) {
    if tx.send(event).is_err() {
        tracing::trace!("Session closed, dropping event");
    }
}

// ============================================================================
// SINKS
// ============================================================================

/// Ereignisse des Signaling-Kanals
pub struct SignalingEventSink {
    tx: ControlSender,
}

impl SignalingEventSink {
    pub(crate) fn new(tx: ControlSender) -> Self {
        Self { tx }
    }

    fn post(&self, event: SignalingEvent) {
        post(&self.tx, SessionEvent::Signaling(event));
    }
}

impl SignalingEvents for SignalingEventSink {
    fn on_connected_to_room(&self, params: SignalingParameters) {
        self.post(SignalingEvent::ConnectedToRoom(params));
    }

    fn on_remote_description(&self, desc: SessionDescription) {
        self.post(SignalingEvent::RemoteDescription(desc));
    }

    fn on_remote_ice_candidate(&self, candidate: IceCandidate) {
        self.post(SignalingEvent::RemoteIceCandidate(candidate));
    }

    fn on_remote_ice_candidates_removed(&self, candidates: Vec<IceCandidate>) {
        self.post(SignalingEvent::RemoteIceCandidatesRemoved(candidates));
    }

    fn on_channel_close(&self) {
        self.post(SignalingEvent::ChannelClose);
    }

    fn on_channel_error(&self, description: String) {
        self.post(SignalingEvent::ChannelError(description));
    }
}

/// Ereignisse der Media Engine
pub struct ConnectionEventSink {
    tx: ControlSender,
}

impl ConnectionEventSink {
    pub(crate) fn new(tx: ControlSender) -> Self {
        Self { tx }
    }

    fn post(&self, event: ConnectionEvent) {
        post(&self.tx, SessionEvent::Connection(event));
    }
}

impl ConnectionEvents for ConnectionEventSink {
    fn on_local_description(&self, desc: SessionDescription) {
        self.post(ConnectionEvent::LocalDescription(desc));
    }

    fn on_ice_candidate(&self, candidate: IceCandidate) {
        self.post(ConnectionEvent::IceCandidate(candidate));
    }

    fn on_ice_candidates_removed(&self, candidates: Vec<IceCandidate>) {
        self.post(ConnectionEvent::IceCandidatesRemoved(candidates));
    }

    fn on_ice_connected(&self) {
        self.post(ConnectionEvent::IceConnected);
    }

    fn on_ice_disconnected(&self) {
        self.post(ConnectionEvent::IceDisconnected);
    }

    fn on_connected(&self) {
        self.post(ConnectionEvent::Connected);
    }

    fn on_disconnected(&self) {
        self.post(ConnectionEvent::Disconnected);
    }

    fn on_connection_closed(&self) {
        self.post(ConnectionEvent::ConnectionClosed);
    }

    fn on_stats_ready(&self, stats: StatsSnapshot) {
        self.post(ConnectionEvent::StatsReady(stats));
    }

    fn on_application_message(&self, message: ApplicationMessage) {
        self.post(ConnectionEvent::ApplicationMessage(message));
    }

    fn on_error(&self, description: String) {
        self.post(ConnectionEvent::Error(description));
    }

    fn on_capture_error(&self, description: String) {
        self.post(ConnectionEvent::CaptureError(description));
    }
}

// ============================================================================
// SESSION HANDLE
// ============================================================================

/// Benutzeraktionen und Beobachtung einer laufenden Session
#[derive(Clone)]
pub struct SessionHandle {
    tx: ControlSender,
    notifications: broadcast::Sender<SessionNotification>,
    snapshot: Arc<RwLock<SessionSnapshot>>,
}

impl SessionHandle {
    pub(crate) fn new(
        tx: ControlSender,
        notifications: broadcast::Sender<SessionNotification>,
        snapshot: Arc<RwLock<SessionSnapshot>>,
    ) -> Self {
        Self {
            tx,
            notifications,
            snapshot,
        }
    }

    #[cfg(test)]
    pub(crate) fn sender(&self) -> ControlSender {
        self.tx.clone()
    }

    fn act(&self, action: UserAction) {
        post(&self.tx, SessionEvent::User(action));
    }

    /// Startet den Anruf; die Bildschirmfreigabe wird als Wert übergeben
    pub fn start_call(&self, screen_grant: Option<ScreenCaptureGrant>) {
        self.act(UserAction::StartCall { screen_grant });
    }

    pub fn hang_up(&self) {
        self.act(UserAction::HangUp);
    }

    pub fn toggle_mic(&self) {
        self.act(UserAction::ToggleMic);
    }

    pub fn switch_camera(&self) {
        self.act(UserAction::SwitchCamera);
    }

    pub fn change_capture_format(&self, width: u32, height: u32, fps: u32) {
        self.act(UserAction::ChangeCaptureFormat(CaptureFormat::new(width, height, fps)));
    }

    pub fn pause_video(&self) {
        self.act(UserAction::PauseVideo);
    }

    pub fn resume_video(&self) {
        self.act(UserAction::ResumeVideo);
    }

    pub fn swap_feeds(&self) {
        self.act(UserAction::SwapFeeds);
    }

    pub fn send_text(&self, text: impl Into<String>) {
        self.act(UserAction::SendText(text.into()));
    }

    pub fn send_score_annotation(&self, text: impl Into<String>) {
        self.act(UserAction::SendScore(text.into()));
    }

    pub fn send_coordinates(&self, stream: CoordinateStream, values: Vec<f32>) {
        self.act(UserAction::SendCoordinates(stream, values));
    }

    pub fn acknowledge_error(&self) {
        self.act(UserAction::AcknowledgeError);
    }

    pub fn shutdown(&self) {
        self.act(UserAction::Shutdown);
    }

    /// Gibt einen Notification-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotification> {
        self.notifications.subscribe()
    }

    /// Aktueller Zustand ohne die Control Queue zu betreten
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.read().clone()
    }

    pub fn state(&self) -> SessionState {
        self.snapshot.read().state
    }
}

/// Protokolliert Notifications bis der Sender verworfen wird
///
/// Verpasste Notifications nach einem Überlauf werden übersprungen, das
/// Logging läuft danach weiter. Gibt die Anzahl protokollierter
/// Notifications zurück.
pub async fn log_notifications(
    mut notifications: broadcast::Receiver<SessionNotification>,
) -> usize {
    let mut logged = 0;
    loop {
        let notification = match notifications.recv().await {
            Ok(notification) => notification,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!("Notification log lagged, skipped {}", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match &notification {
            SessionNotification::Stats(stats) => tracing::debug!(
                "Stats: sent={} received={}",
                stats.bytes_sent,
                stats.bytes_received
            ),
            SessionNotification::Error(error) => tracing::error!("{}", error),
            other => tracing::debug!("{:?}", other),
        }
        logged += 1;
    }
    logged
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot.read();
        f.debug_struct("SessionHandle")
            .field("session", &snapshot.id)
            .field("state", &snapshot.state)
            .finish()
    }
}
