//! Session Orchestrator
//!
//! Führt die Zustandsmaschine einer Session aus. Alle Ereignisse kommen über
//! eine einzige Queue und werden nacheinander in `handle_event` verarbeitet;
//! Zustand und Kollaborateure werden nur dort verändert.

use super::error::SessionError;
use super::events::{
    ConnectionEvent, ConnectionEventSink, SessionEvent, SessionHandle, SessionNotification,
    SignalingEvent, SignalingEventSink, UserAction,
};
use super::state::{Role, Session, SessionSnapshot, SessionState};
use super::ui::CallUi;
use crate::config::SessionConfig;
use crate::media::{
    select_capture_request, AudioRouter, AudioSettings, CaptureRequest, CapturerFactory,
    ConnectionEvents, MediaEngineAdapter, ProxyVideoSink, ScreenCaptureGrant, VideoCapturer,
    VideoSink, WebRtcEngine,
};
use crate::messaging::{MessageRouter, RouterError, StreamHandler, StreamTag};
use crate::signaling::{
    self, IceCandidate, SdpType, SessionDescription, SignalingChannel, SignalingEvents,
    SignalingParameters,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Erstellt den Signaling-Kanal beim Anrufstart
pub type SignalingFactory =
    Box<dyn FnOnce(Arc<dyn SignalingEvents>) -> Box<dyn SignalingChannel> + Send>;

/// Erstellt die Media Engine beim Anrufstart
pub type EngineFactory =
    Box<dyn FnOnce(Arc<dyn ConnectionEvents>) -> Arc<dyn MediaEngineAdapter> + Send>;

/// Die externen Kollaborateure einer Session
pub struct Collaborators {
    pub signaling: SignalingFactory,
    pub engine: EngineFactory,
    pub capturer_factory: Option<Arc<dyn CapturerFactory>>,
    pub audio: Arc<dyn AudioRouter>,
    pub ui: Arc<dyn CallUi>,
}

impl Collaborators {
    /// Signaling nach Raum-Parametern und `WebRtcEngine`
    pub fn webrtc(
        config: &SessionConfig,
        capturer_factory: Option<Arc<dyn CapturerFactory>>,
        audio: Arc<dyn AudioRouter>,
        ui: Arc<dyn CallUi>,
    ) -> Self {
        let signaling_config = config.clone();
        let peer = config.peer.clone();
        Self {
            signaling: Box::new(move |events: Arc<dyn SignalingEvents>| {
                signaling::create_client(&signaling_config, events)
            }),
            engine: Box::new(
                move |events: Arc<dyn ConnectionEvents>| -> Arc<dyn MediaEngineAdapter> {
                    Arc::new(WebRtcEngine::new(peer, events))
                },
            ),
            capturer_factory,
            audio,
            ui,
        }
    }
}

/// Ergebnis eines Session-Laufs
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    pub final_state: SessionState,
    pub error: Option<SessionError>,
    pub call_duration: Option<chrono::Duration>,
}

/// Vor dem Verbindungsobjekt eingetroffene Remote-Signale
#[derive(Debug)]
enum RemoteSignal {
    Description(SessionDescription),
    Candidate(IceCandidate),
    Removal(Vec<IceCandidate>),
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

pub struct SessionOrchestrator {
    config: SessionConfig,
    session: Session,

    rx: mpsc::UnboundedReceiver<SessionEvent>,
    control: mpsc::WeakUnboundedSender<SessionEvent>,
    notifications: broadcast::Sender<SessionNotification>,
    snapshot: Arc<RwLock<SessionSnapshot>>,

    signaling_factory: Option<SignalingFactory>,
    engine_factory: Option<EngineFactory>,
    capturer_factory: Option<Arc<dyn CapturerFactory>>,
    ui: Arc<dyn CallUi>,

    signaling: Option<Box<dyn SignalingChannel>>,
    engine: Option<Arc<dyn MediaEngineAdapter>>,
    audio: Option<Arc<dyn AudioRouter>>,
    capturer: Option<Arc<dyn VideoCapturer>>,
    capture_request: Option<CaptureRequest>,
    screen_grant: Option<ScreenCaptureGrant>,
    local_proxy: Arc<ProxyVideoSink>,
    remote_proxy: Arc<ProxyVideoSink>,
    router: MessageRouter,

    params: Option<SignalingParameters>,
    connection_created: bool,
    pending_remote: Vec<RemoteSignal>,
    feeds_swapped: bool,
    mic_enabled: bool,
    torn_down: bool,
    awaiting_ack: bool,
    first_error: Option<SessionError>,
}

impl SessionOrchestrator {
    /// Erstellt die Session im Zustand IDLE
    pub fn new(config: SessionConfig, collaborators: Collaborators) -> (Self, SessionHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(100);

        let session = Session::new(config.room.room_id.clone());
        let snapshot = Arc::new(RwLock::new(session.snapshot()));
        let handle = SessionHandle::new(tx.clone(), notifications.clone(), Arc::clone(&snapshot));
        let router = MessageRouter::new(config.peer.data_channel.clone());

        let orchestrator = Self {
            config,
            session,
            rx,
            control: tx.downgrade(),
            notifications,
            snapshot,
            signaling_factory: Some(collaborators.signaling),
            engine_factory: Some(collaborators.engine),
            capturer_factory: collaborators.capturer_factory,
            ui: collaborators.ui,
            signaling: None,
            engine: None,
            audio: Some(collaborators.audio),
            capturer: None,
            capture_request: None,
            screen_grant: None,
            local_proxy: Arc::new(ProxyVideoSink::new()),
            remote_proxy: Arc::new(ProxyVideoSink::new()),
            router,
            params: None,
            connection_created: false,
            pending_remote: Vec::new(),
            feeds_swapped: true,
            mic_enabled: true,
            torn_down: false,
            awaiting_ack: false,
            first_error: None,
        };

        (orchestrator, handle)
    }

    /// Registriert einen Handler für eingehende Nachrichten eines Streams
    pub fn register_stream_handler(
        &mut self,
        stream: StreamTag,
        handler: impl StreamHandler + 'static,
    ) {
        self.router.register(stream, handler);
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Parameter aus dem Raum-Beitritt
    pub fn signaling_parameters(&self) -> Option<&SignalingParameters> {
        self.params.as_ref()
    }

    /// Abbau ist erfolgt, die Session nimmt nichts mehr an
    pub fn is_finished(&self) -> bool {
        self.torn_down
    }

    /// Verarbeitet Ereignisse bis zum Abbau
    pub async fn run(mut self) -> SessionOutcome {
        tracing::info!("Session {} started for room '{}'", self.session.id, self.session.room_id);

        while !self.is_finished() {
            match self.rx.recv().await {
                Some(event) => self.handle_event(event),
                None => {
                    tracing::debug!("All session handles dropped");
                    self.teardown();
                }
            }
        }

        self.rx.close();
        let outcome = SessionOutcome {
            final_state: self.session.state,
            error: self.first_error.clone(),
            call_duration: self.session.connected_at.map(|at| chrono::Utc::now() - at),
        };
        tracing::info!("Session {} finished in state {}", self.session.id, outcome.final_state);
        outcome
    }

    /// Ein Schritt der Zustandsmaschine
    pub fn handle_event(&mut self, event: SessionEvent) {
        tracing::trace!("Session event: {:?}", event);

        if self.session.state.is_terminal() {
            self.handle_terminal(event);
            return;
        }

        match event {
            SessionEvent::Signaling(event) => self.handle_signaling(event),
            SessionEvent::Connection(event) => self.handle_connection(event),
            SessionEvent::User(action) => self.handle_user(action),
        }
    }

    fn handle_terminal(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::User(UserAction::AcknowledgeError)
            | SessionEvent::User(UserAction::HangUp)
            | SessionEvent::User(UserAction::Shutdown) => self.teardown(),
            SessionEvent::User(UserAction::SendText(_))
            | SessionEvent::User(UserAction::SendScore(_))
            | SessionEvent::User(UserAction::SendCoordinates(..)) => {
                tracing::warn!("Session is {}, message not sent", self.session.state);
            }
            other => tracing::debug!("Ignoring {:?} in state {}", other, self.session.state),
        }
    }

    // ========================================================================
    // SIGNALING EVENTS
    // ========================================================================

    fn handle_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::ConnectedToRoom(params) => self.on_connected_to_room(params),
            SignalingEvent::RemoteDescription(desc) => {
                self.on_remote_signal(RemoteSignal::Description(desc))
            }
            SignalingEvent::RemoteIceCandidate(candidate) => {
                self.on_remote_signal(RemoteSignal::Candidate(candidate))
            }
            SignalingEvent::RemoteIceCandidatesRemoved(candidates) => {
                self.on_remote_signal(RemoteSignal::Removal(candidates))
            }
            SignalingEvent::ChannelClose => {
                if self.session.state == SessionState::Idle {
                    return;
                }
                tracing::info!("Remote end hung up; dropping PeerConnection");
                self.teardown();
            }
            SignalingEvent::ChannelError(description) => {
                if self.session.state == SessionState::Idle {
                    return;
                }
                self.report_error(SessionError::SignalingFailure(description));
            }
        }
    }

    fn on_connected_to_room(&mut self, params: SignalingParameters) {
        if self.session.state != SessionState::ConnectingSignaling {
            tracing::warn!("Unexpected room join in state {}", self.session.state);
            return;
        }

        let role = Role::from_initiator(params.initiator);
        self.session.role = Some(role);
        tracing::info!(
            "Room connected as {:?}, delay={}ms",
            role,
            self.session.elapsed_ms()
        );
        self.set_state(SessionState::Negotiating);

        if self.config.peer.video_call_enabled {
            if let Err(e) = self.open_capturer() {
                self.report_error(e);
                return;
            }
        }

        let Some(engine) = self.engine.clone() else {
            self.report_error(SessionError::NegotiationFailure(
                "media engine not available".to_string(),
            ));
            return;
        };

        let local_sink: Arc<dyn VideoSink> = self.local_proxy.clone();
        let remote_sink: Arc<dyn VideoSink> = self.remote_proxy.clone();
        engine.create_connection(local_sink, vec![remote_sink], self.capturer.clone(), &params);
        self.connection_created = true;

        match role {
            Role::Initiator => {
                tracing::info!("Creating OFFER...");
                engine.create_offer();
                if params.offer_sdp.is_some() {
                    tracing::warn!("Initiator received an offer in the join payload, ignoring it");
                }
            }
            Role::Responder => {
                if let Some(offer) = params.offer_sdp.clone() {
                    tracing::info!("Received remote offer, creating ANSWER...");
                    self.apply_remote_description(offer);
                }
            }
        }

        for candidate in &params.ice_candidates {
            engine.add_remote_ice_candidate(candidate.clone());
        }
        self.params = Some(params);

        let queued = std::mem::take(&mut self.pending_remote);
        if !queued.is_empty() {
            tracing::debug!("Applying {} remote signals received before the connection", queued.len());
        }
        for signal in queued {
            if self.session.state.is_terminal() {
                break;
            }
            self.apply_remote_signal(signal);
        }
    }

    fn open_capturer(&mut self) -> Result<(), SessionError> {
        let request = select_capture_request(&self.config.capture, self.screen_grant.as_ref())
            .map_err(|e| SessionError::CaptureFailure(e.to_string()))?;

        let Some(factory) = self.capturer_factory.clone() else {
            tracing::warn!("No capture source available, sending no video");
            return Ok(());
        };

        tracing::debug!("Opening capture source {:?}", request);
        let capturer = factory
            .create(&request, self.config.peer.video_codec_hw_acceleration)
            .map_err(|e| SessionError::CaptureFailure(e.to_string()))?;
        self.capturer = Some(capturer);
        self.capture_request = Some(request);
        Ok(())
    }

    fn on_remote_signal(&mut self, signal: RemoteSignal) {
        let state = self.session.state;
        if state != SessionState::ConnectingSignaling && !state.is_negotiating_or_connected() {
            tracing::warn!("Ignoring remote signal in state {}", state);
            return;
        }
        if self.connection_created {
            self.apply_remote_signal(signal);
        } else {
            tracing::debug!("Queueing remote signal until the connection exists");
            self.pending_remote.push(signal);
        }
    }

    fn apply_remote_signal(&mut self, signal: RemoteSignal) {
        let Some(engine) = self.engine.clone() else {
            return;
        };
        match signal {
            RemoteSignal::Description(desc) => self.apply_remote_description(desc),
            RemoteSignal::Candidate(candidate) => engine.add_remote_ice_candidate(candidate),
            RemoteSignal::Removal(candidates) => engine.remove_remote_ice_candidates(candidates),
        }
    }

    fn apply_remote_description(&mut self, desc: SessionDescription) {
        let Some(engine) = self.engine.clone() else {
            return;
        };
        let Some(role) = self.session.role else {
            return;
        };

        if desc.sdp.trim().is_empty() {
            self.report_error(SessionError::NegotiationFailure(format!(
                "empty remote {}",
                desc.sdp_type
            )));
            return;
        }

        let expected = match role {
            Role::Initiator => SdpType::Answer,
            Role::Responder => SdpType::Offer,
        };
        if desc.sdp_type != expected {
            self.report_error(SessionError::NegotiationFailure(format!(
                "received remote {} while acting as {:?}",
                desc.sdp_type, role
            )));
            return;
        }

        if self.session.remote_description_applied {
            tracing::warn!("Remote {} already applied, ignoring", desc.sdp_type);
            return;
        }

        tracing::info!("Received remote {}, delay={}ms", desc.sdp_type, self.session.elapsed_ms());
        engine.set_remote_description(desc);
        self.session.remote_description_applied = true;

        if role == Role::Responder {
            tracing::info!("Creating ANSWER...");
            engine.create_answer();
        }
    }

    // ========================================================================
    // CONNECTION EVENTS
    // ========================================================================

    fn handle_connection(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::LocalDescription(desc) => self.on_local_description(desc),
            ConnectionEvent::IceCandidate(candidate) => {
                if let Some(signaling) = &self.signaling {
                    signaling.send_local_ice_candidate(candidate);
                }
            }
            ConnectionEvent::IceCandidatesRemoved(candidates) => {
                if let Some(signaling) = &self.signaling {
                    signaling.send_local_ice_candidate_removals(candidates);
                }
            }
            ConnectionEvent::IceConnected => {
                tracing::info!("ICE connected, delay={}ms", self.session.elapsed_ms());
            }
            ConnectionEvent::IceDisconnected => tracing::info!("ICE disconnected"),
            ConnectionEvent::Connected => self.on_connected(),
            ConnectionEvent::Disconnected => {
                if self.session.state.is_negotiating_or_connected() {
                    tracing::info!("DTLS disconnected");
                    self.teardown();
                }
            }
            ConnectionEvent::ConnectionClosed => tracing::debug!("Peer connection closed"),
            ConnectionEvent::StatsReady(stats) => {
                if self.session.is_connected {
                    self.notify(SessionNotification::Stats(stats));
                }
            }
            ConnectionEvent::ApplicationMessage(message) => {
                self.router.dispatch(message);
            }
            ConnectionEvent::Error(description) => {
                let error = if self.session.is_connected {
                    SessionError::ConnectivityLost(description)
                } else {
                    SessionError::NegotiationFailure(description)
                };
                self.report_error(error);
            }
            ConnectionEvent::CaptureError(description) => {
                self.report_error(SessionError::CaptureFailure(description));
            }
        }
    }

    fn on_local_description(&mut self, desc: SessionDescription) {
        if !self.session.state.is_negotiating_or_connected() {
            tracing::debug!("Dropping local description in state {}", self.session.state);
            return;
        }
        let (Some(signaling), Some(role)) = (&self.signaling, self.session.role) else {
            return;
        };

        tracing::info!(
            "Sending {}, delay={}ms",
            desc.sdp_type,
            self.session.elapsed_ms()
        );
        match role {
            Role::Initiator => signaling.send_offer_sdp(desc),
            Role::Responder => signaling.send_answer_sdp(desc),
        }
        self.session.local_description_sent = true;

        let max_bitrate = self.config.peer.video_max_bitrate_kbps;
        if max_bitrate > 0 {
            if let Some(engine) = &self.engine {
                tracing::debug!("Set video maximum bitrate: {}", max_bitrate);
                engine.set_max_video_bitrate(max_bitrate);
            }
        }
    }

    fn on_connected(&mut self) {
        if self.session.state != SessionState::Negotiating {
            tracing::debug!("Ignoring connected event in state {}", self.session.state);
            return;
        }
        if !self.session.handshake_complete() {
            self.report_error(SessionError::NegotiationFailure(
                "transport connected before offer/answer completed".to_string(),
            ));
            return;
        }
        let Some(engine) = self.engine.clone() else {
            return;
        };

        tracing::info!("Call connected: delay={}ms", self.session.elapsed_ms());
        self.session.is_connected = true;
        self.session.connected_at = Some(chrono::Utc::now());
        self.set_state(SessionState::Connected);

        engine.enable_statistics(true, self.config.stats_period());
        self.set_swapped_feed(false);
        self.router.attach(engine);
    }

    // ========================================================================
    // USER ACTIONS
    // ========================================================================

    fn handle_user(&mut self, action: UserAction) {
        match action {
            UserAction::StartCall { screen_grant } => self.start_call(screen_grant),
            UserAction::HangUp | UserAction::Shutdown => self.teardown(),
            UserAction::ToggleMic => {
                if let Some(engine) = &self.engine {
                    self.mic_enabled = !self.mic_enabled;
                    engine.set_audio_enabled(self.mic_enabled);
                    self.notify(SessionNotification::MicrophoneEnabled(self.mic_enabled));
                }
            }
            UserAction::SwitchCamera => {
                if let Some(engine) = &self.engine {
                    engine.switch_camera();
                }
            }
            UserAction::ChangeCaptureFormat(format) => {
                if let Some(engine) = &self.engine {
                    engine.change_capture_format(format);
                }
            }
            UserAction::PauseVideo | UserAction::ResumeVideo => {
                let is_screen = self
                    .capture_request
                    .as_ref()
                    .is_some_and(CaptureRequest::is_screen);
                if let (Some(engine), false) = (&self.engine, is_screen) {
                    if action == UserAction::PauseVideo {
                        engine.stop_video_source();
                    } else {
                        engine.start_video_source();
                    }
                }
            }
            UserAction::SwapFeeds => {
                if self.session.state != SessionState::Idle {
                    self.set_swapped_feed(!self.feeds_swapped);
                }
            }
            UserAction::SendText(text) => {
                let result = self.router.send_text(&text);
                self.check_send(StreamTag::Text, result);
            }
            UserAction::SendScore(text) => {
                let result = self.router.send_score_annotation(&text);
                self.check_send(StreamTag::Score, result);
            }
            UserAction::SendCoordinates(stream, values) => {
                let result = self.router.send_coordinates(stream, &values);
                self.check_send(stream.into(), result);
            }
            UserAction::AcknowledgeError => {
                tracing::debug!("No error to acknowledge");
            }
        }
    }

    fn start_call(&mut self, screen_grant: Option<ScreenCaptureGrant>) {
        if self.session.state != SessionState::Idle {
            tracing::warn!("Call already started, ignoring");
            return;
        }
        let (Some(signaling_factory), Some(engine_factory), Some(control)) = (
            self.signaling_factory.take(),
            self.engine_factory.take(),
            self.control.upgrade(),
        ) else {
            tracing::error!("Session cannot start, collaborators missing");
            return;
        };

        self.session.started_at = chrono::Utc::now();
        self.screen_grant = screen_grant;
        self.set_state(SessionState::ConnectingSignaling);
        self.set_swapped_feed(true);

        let connection_events: Arc<dyn ConnectionEvents> =
            Arc::new(ConnectionEventSink::new(control.clone()));
        self.engine = Some(engine_factory(connection_events));

        let signaling_events: Arc<dyn SignalingEvents> =
            Arc::new(SignalingEventSink::new(control.clone()));
        let signaling = signaling_factory(signaling_events);
        tracing::info!("Connecting to room {}", self.config.room.room_id);
        signaling.connect_to_room(self.config.room.clone());
        self.signaling = Some(signaling);

        if let Some(audio) = &self.audio {
            if let Err(e) = audio.start(AudioSettings::from_params(&self.config.peer)) {
                tracing::warn!("Audio routing not started: {}", e);
            }
        }

        if let Some(run_time) = self.config.run_time() {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        tokio::time::sleep(run_time).await;
                        tracing::info!("Run time elapsed, hanging up");
                        let _ = control.send(SessionEvent::User(UserAction::HangUp));
                    });
                }
                Err(_) => tracing::warn!("No runtime, ignoring configured run time"),
            }
        }
    }

    fn check_send(&self, stream: StreamTag, result: Result<(), RouterError>) {
        if let Err(reason) = result {
            tracing::warn!("Message on stream '{}' rejected: {}", stream, reason);
            self.notify(SessionNotification::SendRejected { stream, reason });
        }
    }

    // ========================================================================
    // ERRORS AND TEARDOWN
    // ========================================================================

    /// Einziger Weg in den Zustand ERROR
    fn report_error(&mut self, error: SessionError) {
        if self.session.is_error || self.torn_down {
            tracing::debug!("Suppressing error after first failure: {}", error);
            return;
        }

        tracing::error!("Session error: {}", error);
        self.session.is_error = true;
        self.first_error = Some(error.clone());
        self.set_state(SessionState::Error);
        self.notify(SessionNotification::Error(error.clone()));

        if self.ui.is_interactive() {
            self.awaiting_ack = true;
            self.ui.show_error(&error);
        } else {
            self.teardown();
        }
    }

    /// Gibt alle Ressourcen genau einmal frei
    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.awaiting_ack = false;

        if !self.session.is_error {
            self.set_state(SessionState::Disconnecting);
        }

        self.local_proxy.set_target(None);
        self.remote_proxy.set_target(None);
        self.router.detach();
        self.pending_remote.clear();

        if let Some(capturer) = self.capturer.take() {
            capturer.stop();
        }
        if let Some(signaling) = self.signaling.take() {
            signaling.disconnect_from_room();
        }
        if let Some(engine) = self.engine.take() {
            engine.close();
        }
        if let Some(audio) = self.audio.take() {
            audio.stop();
        }

        self.session.is_connected = false;
        self.set_state(if self.session.is_error {
            SessionState::Error
        } else {
            SessionState::Closed
        });
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn set_swapped_feed(&mut self, swapped: bool) {
        tracing::debug!("Swapped feeds: {}", swapped);
        self.feeds_swapped = swapped;
        let renderers = self.ui.renderers();
        let (local, remote) = if swapped {
            (renderers.fullscreen, renderers.pip)
        } else {
            (renderers.pip, renderers.fullscreen)
        };
        self.local_proxy.set_target(Some(local));
        self.remote_proxy.set_target(Some(remote));
        self.ui.on_feeds_swapped(swapped);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.session.state == state {
            self.publish_snapshot();
            return;
        }
        tracing::info!("Session state: {} -> {}", self.session.state, state);
        self.session.state = state;
        self.publish_snapshot();
        self.notify(SessionNotification::StateChanged(state));
    }

    fn publish_snapshot(&self) {
        *self.snapshot.write() = self.session.snapshot();
    }

    fn notify(&self, notification: SessionNotification) {
        let _ = self.notifications.send(notification);
    }
}

impl std::fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("session", &self.session.id)
            .field("state", &self.session.state)
            .field("role", &self.session.role)
            .field("router", &self.router)
            .finish()
    }
}
