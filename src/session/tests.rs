use super::*;
use crate::config::{RoomConnectionParameters, SessionConfig};
use crate::media::test_support::{EngineCall, RecordingEngine};
use crate::media::{
    AudioError, AudioRouter, AudioSettings, CaptureError, CaptureFormat, CaptureRequest,
    CapturerFactory, ConnectionEvents, CountingSink, MediaEngineAdapter, ScreenCaptureGrant, VideoCapturer,
    VideoSink,
};
use crate::messaging::{ApplicationMessage, CoordinateStream, StreamPayload, StreamTag};
use crate::signaling::{
    IceCandidate, PeerMessage, SessionDescription, SignalingChannel, SignalingEvents,
    SignalingParameters,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// MOCK COLLABORATORS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum SignalingCall {
    Connect(String),
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
    Removals(Vec<IceCandidate>),
    Disconnect,
}

#[derive(Clone, Default)]
struct RecordingSignaling {
    calls: Arc<Mutex<Vec<SignalingCall>>>,
}

impl RecordingSignaling {
    fn calls(&self) -> Vec<SignalingCall> {
        self.calls.lock().clone()
    }

    fn count(&self, predicate: impl Fn(&SignalingCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| predicate(c)).count()
    }
}

impl SignalingChannel for RecordingSignaling {
    fn connect_to_room(&self, params: RoomConnectionParameters) {
        self.calls.lock().push(SignalingCall::Connect(params.room_id));
    }
    fn send_offer_sdp(&self, desc: SessionDescription) {
        self.calls.lock().push(SignalingCall::Offer(desc));
    }
    fn send_answer_sdp(&self, desc: SessionDescription) {
        self.calls.lock().push(SignalingCall::Answer(desc));
    }
    fn send_local_ice_candidate(&self, candidate: IceCandidate) {
        self.calls.lock().push(SignalingCall::Candidate(candidate));
    }
    fn send_local_ice_candidate_removals(&self, candidates: Vec<IceCandidate>) {
        self.calls.lock().push(SignalingCall::Removals(candidates));
    }
    fn disconnect_from_room(&self) {
        self.calls.lock().push(SignalingCall::Disconnect);
    }
}

#[derive(Default)]
struct FakeCapturer {
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl VideoCapturer for FakeCapturer {
    fn start(&self, _format: CaptureFormat, _sink: Arc<dyn VideoSink>) -> Result<(), CaptureError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
    fn change_format(&self, _format: CaptureFormat) {}
}

#[derive(Default)]
struct FakeCapturerFactory {
    capturer: Arc<FakeCapturer>,
    requests: Mutex<Vec<CaptureRequest>>,
}

impl CapturerFactory for FakeCapturerFactory {
    fn create(
        &self,
        request: &CaptureRequest,
        _hw_acceleration: bool,
    ) -> Result<Arc<dyn VideoCapturer>, CaptureError> {
        self.requests.lock().push(request.clone());
        Ok(self.capturer.clone())
    }
}

#[derive(Default)]
struct CountingAudio {
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl AudioRouter for CountingAudio {
    fn start(&self, _settings: AudioSettings) -> Result<(), AudioError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct TestUi {
    interactive: bool,
    errors: Mutex<Vec<SessionError>>,
    swaps: Mutex<Vec<bool>>,
    fullscreen: Arc<CountingSink>,
    pip: Arc<CountingSink>,
}

impl CallUi for TestUi {
    fn is_interactive(&self) -> bool {
        self.interactive
    }
    fn show_error(&self, error: &SessionError) {
        self.errors.lock().push(error.clone());
    }
    fn renderers(&self) -> Renderers {
        Renderers {
            fullscreen: self.fullscreen.clone(),
            pip: self.pip.clone(),
        }
    }
    fn on_feeds_swapped(&self, swapped: bool) {
        self.swaps.lock().push(swapped);
    }
}

// ============================================================================
// HARNESS
// ============================================================================

struct Harness {
    orchestrator: SessionOrchestrator,
    handle: SessionHandle,
    signaling: RecordingSignaling,
    engine: Arc<RecordingEngine>,
    capture: Arc<FakeCapturerFactory>,
    audio: Arc<CountingAudio>,
    ui: Arc<TestUi>,
}

fn test_config() -> SessionConfig {
    let mut config = SessionConfig::default();
    config.room = RoomConnectionParameters::new("http://localhost:4000/", "room-42", false);
    config
}

fn harness_with(config: SessionConfig, interactive: bool) -> Harness {
    let signaling = RecordingSignaling::default();
    let engine = RecordingEngine::new();
    let capture = Arc::new(FakeCapturerFactory::default());
    let audio = Arc::new(CountingAudio::default());
    let ui = Arc::new(TestUi {
        interactive,
        ..Default::default()
    });

    let signaling_clone = signaling.clone();
    let engine_clone: Arc<dyn MediaEngineAdapter> = engine.clone();
    let collaborators = Collaborators {
        signaling: Box::new(
            move |_events: Arc<dyn SignalingEvents>| -> Box<dyn SignalingChannel> {
                Box::new(signaling_clone)
            },
        ),
        engine: Box::new(move |_events: Arc<dyn ConnectionEvents>| engine_clone),
        capturer_factory: Some(capture.clone()),
        audio: audio.clone(),
        ui: ui.clone(),
    };
    let (orchestrator, handle) = SessionOrchestrator::new(config, collaborators);

    Harness {
        orchestrator,
        handle,
        signaling,
        engine,
        capture,
        audio,
        ui,
    }
}

fn harness() -> Harness {
    harness_with(test_config(), false)
}

fn candidate(sdp: &str) -> IceCandidate {
    IceCandidate::new("0", 0, sdp)
}

fn join_params(initiator: bool, offer: Option<SessionDescription>) -> SignalingParameters {
    SignalingParameters {
        initiator,
        client_id: "client".to_string(),
        room_id: "room-42".to_string(),
        offer_sdp: offer,
        ice_candidates: Vec::new(),
        ice_servers: Vec::new(),
    }
}

impl Harness {
    fn signal(&mut self, event: SignalingEvent) {
        self.orchestrator.handle_event(SessionEvent::Signaling(event));
    }

    fn connection(&mut self, event: ConnectionEvent) {
        self.orchestrator.handle_event(SessionEvent::Connection(event));
    }

    fn user(&mut self, action: UserAction) {
        self.orchestrator.handle_event(SessionEvent::User(action));
    }

    fn start(&mut self) {
        self.user(UserAction::StartCall { screen_grant: None });
    }

    /// Initiator bis CONNECTED
    fn connect_as_initiator(&mut self) {
        self.start();
        self.signal(SignalingEvent::ConnectedToRoom(join_params(true, None)));
        self.connection(ConnectionEvent::LocalDescription(SessionDescription::offer("v=0 local")));
        self.signal(SignalingEvent::RemoteDescription(SessionDescription::answer("v=0 remote")));
        self.connection(ConnectionEvent::Connected);
    }

    fn engine_count(&self, predicate: impl Fn(&EngineCall) -> bool) -> usize {
        self.engine.count(predicate)
    }

    fn state(&self) -> SessionState {
        self.orchestrator.state()
    }
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[test]
fn test_responder_scenario() {
    let mut h = harness();
    let offer = SessionDescription::offer("v=0 remote offer");
    let c1 = candidate("candidate:1");

    h.start();
    assert_eq!(h.state(), SessionState::ConnectingSignaling);
    assert_eq!(h.signaling.calls(), vec![SignalingCall::Connect("room-42".to_string())]);

    let mut params = join_params(false, Some(offer.clone()));
    params.ice_candidates = vec![c1.clone()];
    h.signal(SignalingEvent::ConnectedToRoom(params));
    assert_eq!(h.state(), SessionState::Negotiating);

    let calls = h.engine.calls();
    assert!(matches!(calls[0], EngineCall::CreateConnection { has_capturer: true, remote_sinks: 1, .. }));
    assert_eq!(calls[1], EngineCall::SetRemoteDescription(offer));
    assert_eq!(calls[2], EngineCall::CreateAnswer);
    assert_eq!(calls[3], EngineCall::AddRemoteCandidate(c1));
    assert_eq!(h.engine_count(|c| *c == EngineCall::CreateOffer), 0);

    let answer = SessionDescription::answer("v=0 local answer");
    h.connection(ConnectionEvent::LocalDescription(answer.clone()));
    assert_eq!(h.signaling.count(|c| *c == SignalingCall::Answer(answer.clone())), 1);
    assert_eq!(h.signaling.count(|c| matches!(c, SignalingCall::Offer(_))), 0);
    assert_eq!(h.orchestrator.session().role, Some(Role::Responder));
}

#[test]
fn test_initiator_creates_offer_first() {
    let mut h = harness();
    h.start();
    h.signal(SignalingEvent::ConnectedToRoom(join_params(true, None)));

    let calls = h.engine.calls();
    assert!(matches!(calls[0], EngineCall::CreateConnection { .. }));
    assert_eq!(calls[1], EngineCall::CreateOffer);

    let offer = SessionDescription::offer("v=0 local");
    h.connection(ConnectionEvent::LocalDescription(offer.clone()));
    assert!(h.signaling.calls().contains(&SignalingCall::Offer(offer)));

    let answer = SessionDescription::answer("v=0 remote");
    h.signal(SignalingEvent::RemoteDescription(answer.clone()));
    assert!(h.engine.calls().contains(&EngineCall::SetRemoteDescription(answer)));
    assert_eq!(h.engine_count(|c| *c == EngineCall::CreateAnswer), 0);
}

#[test]
fn test_channel_close_after_connected() {
    let mut h = harness();
    h.connect_as_initiator();
    assert_eq!(h.state(), SessionState::Connected);
    assert!(h.orchestrator.session().is_connected);

    h.signal(SignalingEvent::ChannelClose);

    assert_eq!(h.state(), SessionState::Closed);
    assert!(!h.orchestrator.session().is_connected);
    assert_eq!(h.signaling.count(|c| *c == SignalingCall::Disconnect), 1);
    assert_eq!(h.engine_count(|c| *c == EngineCall::Close), 1);
    assert_eq!(h.capture.capturer.stops.load(Ordering::SeqCst), 1);
    assert_eq!(h.audio.stops.load(Ordering::SeqCst), 1);
    assert!(h.orchestrator.is_finished());
}

#[test]
fn test_teardown_is_idempotent() {
    let mut h = harness();
    h.connect_as_initiator();

    h.user(UserAction::HangUp);
    h.user(UserAction::HangUp);
    h.user(UserAction::Shutdown);
    h.signal(SignalingEvent::ChannelClose);
    h.connection(ConnectionEvent::Disconnected);

    assert_eq!(h.state(), SessionState::Closed);
    assert_eq!(h.signaling.count(|c| *c == SignalingCall::Disconnect), 1);
    assert_eq!(h.engine_count(|c| *c == EngineCall::Close), 1);
    assert_eq!(h.capture.capturer.stops.load(Ordering::SeqCst), 1);
    assert_eq!(h.audio.stops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_closed_state_absorbs_events() {
    let mut h = harness();
    h.connect_as_initiator();
    h.user(UserAction::HangUp);
    let calls_before = h.engine.calls().len();

    h.signal(SignalingEvent::ConnectedToRoom(join_params(true, None)));
    h.signal(SignalingEvent::RemoteDescription(SessionDescription::answer("late")));
    h.signal(SignalingEvent::RemoteIceCandidate(candidate("late")));
    h.connection(ConnectionEvent::Connected);
    h.connection(ConnectionEvent::Error("late failure".to_string()));
    h.user(UserAction::StartCall { screen_grant: None });

    assert_eq!(h.state(), SessionState::Closed);
    assert_eq!(h.engine.calls().len(), calls_before);
    assert!(!h.orchestrator.session().is_error);
}

#[test]
fn test_error_state_absorbs_events() {
    let mut h = harness();
    h.start();
    h.signal(SignalingEvent::ChannelError("websocket reset".to_string()));
    assert_eq!(h.state(), SessionState::Error);

    h.signal(SignalingEvent::ConnectedToRoom(join_params(false, None)));
    h.connection(ConnectionEvent::Connected);
    h.user(UserAction::HangUp);

    assert_eq!(h.state(), SessionState::Error);
    assert_eq!(h.engine_count(|c| matches!(c, EngineCall::CreateConnection { .. })), 0);
}

#[test]
fn test_candidates_before_connection_are_queued() {
    let mut h = harness();
    h.start();

    let early = candidate("candidate:early");
    h.signal(SignalingEvent::RemoteIceCandidate(early.clone()));
    h.signal(SignalingEvent::RemoteIceCandidatesRemoved(vec![candidate("candidate:gone")]));
    assert!(h.engine.calls().is_empty());

    h.signal(SignalingEvent::ConnectedToRoom(join_params(true, None)));
    let calls = h.engine.calls();
    assert!(matches!(calls[0], EngineCall::CreateConnection { .. }));
    assert_eq!(calls[1], EngineCall::CreateOffer);
    assert_eq!(calls[2], EngineCall::AddRemoteCandidate(early));
    assert_eq!(
        calls[3],
        EngineCall::RemoveRemoteCandidates(vec![candidate("candidate:gone")])
    );
}

#[test]
fn test_stored_removal_never_applied_at_join() {
    let mut h = harness();
    h.start();

    let withdrawn = candidate("candidate:withdrawn");
    let kept = candidate("candidate:kept");
    let params = SignalingParameters::from_stored_messages(
        "room-42".to_string(),
        "client".to_string(),
        false,
        vec![
            PeerMessage::Offer {
                sdp: "v=0 offer".to_string(),
            },
            PeerMessage::Candidate(withdrawn.clone()),
            PeerMessage::Candidate(kept.clone()),
            PeerMessage::RemoveCandidates {
                candidates: vec![withdrawn.clone()],
            },
        ],
        Vec::new(),
    );
    h.signal(SignalingEvent::ConnectedToRoom(params));

    let calls = h.engine.calls();
    assert!(!calls.contains(&EngineCall::AddRemoteCandidate(withdrawn)));
    assert!(calls.contains(&EngineCall::AddRemoteCandidate(kept)));
}

#[test]
fn test_removals_forwarded_as_one_batch() {
    let mut h = harness();
    h.connect_as_initiator();

    let batch = vec![candidate("a"), candidate("b"), candidate("c")];
    h.signal(SignalingEvent::RemoteIceCandidatesRemoved(batch.clone()));
    assert_eq!(
        h.engine_count(|c| matches!(c, EngineCall::RemoveRemoteCandidates(_))),
        1
    );
    assert!(h.engine.calls().contains(&EngineCall::RemoveRemoteCandidates(batch.clone())));

    h.connection(ConnectionEvent::IceCandidatesRemoved(batch.clone()));
    assert!(h.signaling.calls().contains(&SignalingCall::Removals(batch)));
}

#[test]
fn test_local_candidates_forwarded_in_order() {
    let mut h = harness();
    h.start();
    h.signal(SignalingEvent::ConnectedToRoom(join_params(true, None)));

    h.connection(ConnectionEvent::IceCandidate(candidate("1")));
    h.connection(ConnectionEvent::IceCandidate(candidate("2")));

    let sent: Vec<_> = h
        .signaling
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            SignalingCall::Candidate(c) => Some(c.sdp),
            _ => None,
        })
        .collect();
    assert_eq!(sent, vec!["1", "2"]);
}

#[test]
fn test_connected_requires_handshake() {
    let mut h = harness();
    h.start();
    h.signal(SignalingEvent::ConnectedToRoom(join_params(true, None)));
    h.connection(ConnectionEvent::Connected);

    assert_eq!(h.state(), SessionState::Error);
    assert!(!h.orchestrator.session().is_connected);
    assert!(matches!(
        h.handle.snapshot().state,
        SessionState::Error
    ));
}

#[test]
fn test_responder_rejects_answer() {
    let mut h = harness();
    h.start();
    h.signal(SignalingEvent::ConnectedToRoom(join_params(false, None)));
    h.signal(SignalingEvent::RemoteDescription(SessionDescription::answer("v=0")));

    assert_eq!(h.state(), SessionState::Error);
    assert_eq!(h.engine_count(|c| matches!(c, EngineCall::SetRemoteDescription(_))), 0);
}

#[test]
fn test_empty_remote_description_fails() {
    let mut h = harness();
    h.start();
    h.signal(SignalingEvent::ConnectedToRoom(join_params(false, None)));
    h.signal(SignalingEvent::RemoteDescription(SessionDescription::offer("  ")));

    assert_eq!(h.state(), SessionState::Error);
    assert_eq!(h.engine_count(|c| *c == EngineCall::CreateAnswer), 0);
}

#[test]
fn test_headless_error_tears_down_immediately() {
    let mut h = harness();
    h.connect_as_initiator();
    h.connection(ConnectionEvent::Error("ICE connection failed.".to_string()));

    assert_eq!(h.state(), SessionState::Error);
    assert!(h.orchestrator.is_finished());
    assert_eq!(h.engine_count(|c| *c == EngineCall::Close), 1);
    assert!(h.ui.errors.lock().is_empty());
}

#[test]
fn test_interactive_error_waits_for_acknowledgement() {
    let mut h = harness_with(test_config(), true);
    h.connect_as_initiator();

    h.connection(ConnectionEvent::Error("DTLS connection failed.".to_string()));
    h.signal(SignalingEvent::ChannelError("second".to_string()));

    assert_eq!(h.state(), SessionState::Error);
    assert!(!h.orchestrator.is_finished());
    assert_eq!(
        *h.ui.errors.lock(),
        vec![SessionError::ConnectivityLost("DTLS connection failed.".to_string())]
    );
    assert_eq!(h.engine_count(|c| *c == EngineCall::Close), 0);

    h.user(UserAction::AcknowledgeError);
    assert!(h.orchestrator.is_finished());
    assert_eq!(h.state(), SessionState::Error);
    assert_eq!(h.engine_count(|c| *c == EngineCall::Close), 1);
}

#[test]
fn test_screen_capture_without_grant_fails() {
    let mut config = test_config();
    config.capture.screencapture = true;
    let mut h = harness_with(config, false);

    h.start();
    h.signal(SignalingEvent::ConnectedToRoom(join_params(true, None)));

    assert_eq!(h.state(), SessionState::Error);
    assert_eq!(h.engine_count(|c| matches!(c, EngineCall::CreateConnection { .. })), 0);
}

#[test]
fn test_screen_capture_grant_passed_as_value() {
    let mut config = test_config();
    config.capture.screencapture = true;
    let mut h = harness_with(config, false);

    h.user(UserAction::StartCall {
        screen_grant: Some(ScreenCaptureGrant::Granted {
            token: "projection".to_string(),
        }),
    });
    h.signal(SignalingEvent::ConnectedToRoom(join_params(true, None)));

    assert_eq!(h.state(), SessionState::Negotiating);
    assert!(h.capture.requests.lock()[0].is_screen());

    // Bildschirmaufnahme läuft im Hintergrund weiter
    h.user(UserAction::PauseVideo);
    assert_eq!(h.engine_count(|c| *c == EngineCall::StopVideoSource), 0);
}

#[test]
fn test_capture_error_from_engine() {
    let mut h = harness();
    let mut notifications = h.handle.subscribe();
    h.start();
    h.signal(SignalingEvent::ConnectedToRoom(join_params(true, None)));
    h.connection(ConnectionEvent::CaptureError("camera busy".to_string()));

    assert_eq!(h.state(), SessionState::Error);
    let errors: Vec<_> = std::iter::from_fn(|| notifications.try_recv().ok())
        .filter_map(|n| match n {
            SessionNotification::Error(error) => Some(error),
            _ => None,
        })
        .collect();
    assert_eq!(
        errors,
        vec![SessionError::CaptureFailure("camera busy".to_string())]
    );
}

#[test]
fn test_max_bitrate_after_local_description() {
    let mut config = test_config();
    config.peer.video_max_bitrate_kbps = 1700;
    let mut h = harness_with(config, false);

    h.start();
    h.signal(SignalingEvent::ConnectedToRoom(join_params(true, None)));
    assert_eq!(h.engine_count(|c| matches!(c, EngineCall::SetMaxVideoBitrate(_))), 0);

    h.connection(ConnectionEvent::LocalDescription(SessionDescription::offer("v=0")));
    assert!(h.engine.calls().contains(&EngineCall::SetMaxVideoBitrate(1700)));
}

#[test]
fn test_connected_enables_stats_and_unswaps_feeds() {
    let mut h = harness();
    h.connect_as_initiator();

    assert!(h
        .engine
        .calls()
        .contains(&EngineCall::EnableStatistics(true, Duration::from_millis(1000))));
    assert_eq!(*h.ui.swaps.lock(), vec![true, false]);

    h.user(UserAction::SwapFeeds);
    assert_eq!(h.ui.swaps.lock().last(), Some(&true));
}

#[test]
fn test_video_disabled_skips_capture() {
    let mut config = test_config();
    config.peer.video_call_enabled = false;
    let mut h = harness_with(config, false);

    h.start();
    h.signal(SignalingEvent::ConnectedToRoom(join_params(true, None)));
    assert!(matches!(
        h.engine.calls()[0],
        EngineCall::CreateConnection { has_capturer: false, .. }
    ));
    assert!(h.capture.requests.lock().is_empty());
}

// ============================================================================
// APPLICATION MESSAGES
// ============================================================================

#[test]
fn test_coordinates_deferred_until_connected() {
    let mut h = harness();
    h.start();
    h.user(UserAction::SendCoordinates(
        CoordinateStream::Finger1,
        vec![1.0, 2.0, 3.0],
    ));
    h.signal(SignalingEvent::ConnectedToRoom(join_params(true, None)));
    assert!(h.engine.sent().is_empty());

    h.connection(ConnectionEvent::LocalDescription(SessionDescription::offer("v=0")));
    h.signal(SignalingEvent::RemoteDescription(SessionDescription::answer("v=0")));
    h.connection(ConnectionEvent::Connected);

    let sent = h.engine.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].tag, "finger1");
    assert_eq!(sent[0].as_coordinates().unwrap(), vec![1.0, 2.0, 3.0]);
}

#[test]
fn test_unknown_inbound_tag_does_not_block_delivery() {
    let mut h = harness();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    h.orchestrator
        .register_stream_handler(
            StreamTag::Score,
            move |stream: StreamTag, payload: StreamPayload| {
                sink.lock().push((stream, payload));
            },
        );
    h.connect_as_initiator();

    h.connection(ConnectionEvent::ApplicationMessage(ApplicationMessage::text(
        "tilt", "12",
    )));
    h.connection(ConnectionEvent::ApplicationMessage(ApplicationMessage::text(
        "score", "97",
    )));

    assert_eq!(h.state(), SessionState::Connected);
    assert_eq!(
        *received.lock(),
        vec![(StreamTag::Score, StreamPayload::Text("97".to_string()))]
    );
}

#[test]
fn test_rejected_send_is_reported() {
    let mut config = test_config();
    if let Some(channel) = config.peer.data_channel.as_mut() {
        channel.ordered = false;
    }
    let mut h = harness_with(config, false);
    let mut notifications = h.handle.subscribe();

    h.connect_as_initiator();
    h.user(UserAction::SendText("hello".to_string()));

    let rejected = std::iter::from_fn(|| notifications.try_recv().ok())
        .find(|n| matches!(n, SessionNotification::SendRejected { .. }));
    assert!(matches!(
        rejected,
        Some(SessionNotification::SendRejected {
            stream: StreamTag::Text,
            ..
        })
    ));
    assert!(h.engine.sent().is_empty());
}

#[test]
fn test_toggle_mic() {
    let mut h = harness();
    h.connect_as_initiator();
    h.user(UserAction::ToggleMic);
    h.user(UserAction::ToggleMic);

    let toggles: Vec<_> = h
        .engine
        .calls()
        .into_iter()
        .filter(|c| matches!(c, EngineCall::SetAudioEnabled(_)))
        .collect();
    assert_eq!(
        toggles,
        vec![
            EngineCall::SetAudioEnabled(false),
            EngineCall::SetAudioEnabled(true)
        ]
    );
}

// ============================================================================
// CONTROL QUEUE
// ============================================================================

#[tokio::test]
async fn test_run_until_hang_up() {
    let h = harness();
    let handle = h.handle.clone();
    let mut notifications = handle.subscribe();

    let task = tokio::spawn(h.orchestrator.run());
    handle.start_call(None);
    handle.hang_up();

    let outcome = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.final_state, SessionState::Closed);
    assert!(outcome.error.is_none());
    assert_eq!(handle.state(), SessionState::Closed);
    assert_eq!(h.audio.starts.load(Ordering::SeqCst), 1);
    assert_eq!(h.audio.stops.load(Ordering::SeqCst), 1);

    let states: Vec<_> = std::iter::from_fn(|| notifications.try_recv().ok())
        .filter_map(|n| match n {
            SessionNotification::StateChanged(state) => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            SessionState::ConnectingSignaling,
            SessionState::Disconnecting,
            SessionState::Closed
        ]
    );

    // Späte Aktionen nach dem Abbau gehen ins Leere
    handle.send_text("late");
}

#[tokio::test]
async fn test_sinks_post_into_control_queue() {
    let h = harness();
    let handle = h.handle.clone();
    let tx = handle_sender(&handle);
    let signaling_sink = SignalingEventSink::new(tx.clone());
    let connection_sink = ConnectionEventSink::new(tx);

    let task = tokio::spawn(h.orchestrator.run());
    handle.start_call(None);
    signaling_sink.on_connected_to_room(join_params(true, None));
    connection_sink.on_local_description(SessionDescription::offer("v=0"));
    signaling_sink.on_channel_close();

    let outcome = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.final_state, SessionState::Closed);
    assert!(h
        .signaling
        .calls()
        .contains(&SignalingCall::Offer(SessionDescription::offer("v=0"))));
}

fn handle_sender(handle: &SessionHandle) -> super::events::ControlSender {
    handle.sender()
}

#[tokio::test]
async fn test_notification_log_survives_overflow() {
    let (tx, rx) = tokio::sync::broadcast::channel(2);
    for enabled in [true, false, true, false, true] {
        tx.send(SessionNotification::MicrophoneEnabled(enabled)).unwrap();
    }
    drop(tx);

    let logged = tokio::time::timeout(Duration::from_secs(1), log_notifications(rx))
        .await
        .expect("logger stops once the sender is gone");
    assert_eq!(logged, 2);
}
