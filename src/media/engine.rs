//! WebRTC Media Engine
//!
//! Implementiert `MediaEngineAdapter` über die `webrtc` Crate. Alle Aufrufe
//! landen als Kommando in einer Queue, die ein einzelner Worker-Task
//! abarbeitet. Dadurch werden Beschreibungen, Kandidaten und Entfernungen in
//! Ankunftsreihenfolge angewendet.

use super::adapter::{ConnectionEvents, EngineError, MediaEngineAdapter, StatsSnapshot};
use super::capture::{CaptureFormat, VideoCapturer};
use super::sink::{VideoFrame, VideoSink};
use crate::config::{DataChannelParameters, PeerConnectionParameters};
use crate::messaging::ApplicationMessage;
use crate::signaling::{IceCandidate, IceServer, SdpType, SessionDescription, SignalingParameters};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{
    MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8, MIME_TYPE_VP9,
};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCPFeedback, RTCRtpTransceiverInit};
use webrtc::stats::{StatsReport, StatsReportType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Label des Data Channels
pub const DATA_CHANNEL_LABEL: &str = "ApprtcDemo data";

/// Nachrichten, die auf das Öffnen des Data Channels warten
const PENDING_OUTBOUND_LIMIT: usize = 256;

/// Frames zwischen Capturer und Video-Track
const FRAME_QUEUE_SIZE: usize = 30;

const STREAM_ID: &str = "ARDAMS";

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Standard STUN Server, wenn der Raum keine liefert
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
            "stun:stun2.l.google.com:19302".to_string(),
        ],
        ..Default::default()
    }]
}

fn ice_servers_from(servers: &[IceServer]) -> Vec<RTCIceServer> {
    if servers.is_empty() {
        return default_ice_servers();
    }
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone(),
            credential: server.credential.clone(),
            ..Default::default()
        })
        .collect()
}

// ============================================================================
// CODECS
// ============================================================================

fn video_feedback() -> Vec<RTCPFeedback> {
    [("goog-remb", ""), ("ccm", "fir"), ("nack", ""), ("nack", "pli")]
        .into_iter()
        .map(|(typ, parameter)| RTCPFeedback {
            typ: typ.to_string(),
            parameter: parameter.to_string(),
        })
        .collect()
}

/// Codec-Parameter für den bevorzugten Video-Codec
///
/// Unbekannte Namen fallen auf VP8 zurück.
pub(crate) fn video_codec_parameters(preference: &str) -> RTCRtpCodecParameters {
    let (mime_type, payload_type, fmtp) = match preference {
        "VP8" => (MIME_TYPE_VP8, 96, ""),
        "VP9" => (MIME_TYPE_VP9, 98, "profile-id=0"),
        "H264" | "H264 Baseline" => (
            MIME_TYPE_H264,
            102,
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
        ),
        "H264 High" => (
            MIME_TYPE_H264,
            127,
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=640c1f",
        ),
        other => {
            tracing::warn!("Unknown video codec '{}', falling back to VP8", other);
            (MIME_TYPE_VP8, 96, "")
        }
    };

    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: mime_type.to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: fmtp.to_string(),
            rtcp_feedback: video_feedback(),
        },
        payload_type,
        ..Default::default()
    }
}

/// Opus mit optionaler Start-Bitrate
pub(crate) fn audio_codec_parameters(codec: &str, start_bitrate_kbps: u32) -> RTCRtpCodecParameters {
    if !codec.eq_ignore_ascii_case("OPUS") {
        tracing::warn!("Audio codec '{}' not available, using OPUS", codec);
    }

    let mut fmtp = "minptime=10;useinbandfec=1".to_string();
    if start_bitrate_kbps > 0 {
        fmtp.push_str(&format!(";maxaveragebitrate={}", start_bitrate_kbps * 1000));
    }

    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: fmtp,
            rtcp_feedback: vec![],
        },
        payload_type: 111,
        ..Default::default()
    }
}

pub(crate) fn data_channel_init(params: &DataChannelParameters) -> RTCDataChannelInit {
    RTCDataChannelInit {
        ordered: Some(params.ordered),
        max_packet_life_time: params.max_retransmit_time_ms,
        max_retransmits: params.max_retransmits,
        protocol: Some(params.protocol.clone()),
        negotiated: if params.negotiated {
            params.channel_id
        } else {
            None
        },
    }
}

// ============================================================================
// CANDIDATES
// ============================================================================

fn candidate_init(candidate: &IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.sdp.clone(),
        sdp_mid: Some(candidate.sdp_mid.clone()),
        sdp_mline_index: Some(candidate.sdp_mline_index),
        ..Default::default()
    }
}

fn candidate_from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        sdp_mid: init.sdp_mid.unwrap_or_default(),
        sdp_mline_index: init.sdp_mline_index.unwrap_or(0),
        sdp: init.candidate,
    }
}

/// Was mit einem eingehenden Kandidaten passiert
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Admission {
    Apply(IceCandidate),
    Queued,
    Removed,
}

/// Merkt sich entfernte Kandidaten und puffert Kandidaten bis zur
/// Remote-Beschreibung
///
/// Die `webrtc` Crate kann angewendete Kandidaten nicht zurücknehmen. Ein
/// entfernter Kandidat wird deshalb nie wieder angewendet, auch wenn er
/// später erneut eintrifft. Ein Removal-Batch negiert nur Kandidaten, die
/// noch gepuffert sind oder erst danach eintreffen. Wurde ein Kandidat vor
/// seinem Removal bereits angewendet, bleibt er im ICE Agent der Crate als
/// Paarungskandidat erhalten.
#[derive(Debug)]
pub(crate) struct CandidateFilter {
    removed: HashSet<IceCandidate>,
    pending: Option<Vec<IceCandidate>>,
}

impl CandidateFilter {
    pub(crate) fn new() -> Self {
        Self {
            removed: HashSet::new(),
            pending: Some(Vec::new()),
        }
    }

    pub(crate) fn admit(&mut self, candidate: IceCandidate) -> Admission {
        if self.removed.contains(&candidate) {
            return Admission::Removed;
        }
        match self.pending.as_mut() {
            Some(pending) => {
                pending.push(candidate);
                Admission::Queued
            }
            None => Admission::Apply(candidate),
        }
    }

    /// Entfernt den Batch; gibt zurück, wie viele gepufferte Kandidaten
    /// dabei verworfen wurden
    pub(crate) fn remove(&mut self, batch: &[IceCandidate]) -> usize {
        self.removed.extend(batch.iter().cloned());
        match self.pending.as_mut() {
            Some(pending) => {
                let before = pending.len();
                pending.retain(|c| !batch.contains(c));
                before - pending.len()
            }
            None => 0,
        }
    }

    /// Remote-Beschreibung gesetzt, gepufferte Kandidaten freigeben
    pub(crate) fn release(&mut self) -> Vec<IceCandidate> {
        self.pending.take().unwrap_or_default()
    }
}

// ============================================================================
// STATISTICS
// ============================================================================

fn summarize(report: &StatsReport) -> StatsSnapshot {
    let mut snapshot = StatsSnapshot {
        report_count: report.reports.len(),
        ..StatsSnapshot::empty()
    };
    for stats in report.reports.values() {
        if let StatsReportType::CandidatePair(pair) = stats {
            snapshot.bytes_sent += pair.bytes_sent;
            snapshot.bytes_received += pair.bytes_received;
        }
    }
    snapshot
}

// ============================================================================
// COMMANDS
// ============================================================================

enum EngineCommand {
    CreateConnection {
        local_sink: Arc<dyn VideoSink>,
        remote_sinks: Vec<Arc<dyn VideoSink>>,
        capturer: Option<Arc<dyn VideoCapturer>>,
        params: SignalingParameters,
    },
    CreateOffer,
    CreateAnswer,
    SetRemoteDescription(SessionDescription),
    AddRemoteCandidate(IceCandidate),
    RemoveRemoteCandidates(Vec<IceCandidate>),
    EnableStatistics { enabled: bool, period: Duration },
    SetMaxVideoBitrate(u32),
    SetAudioEnabled(bool),
    StartVideoSource,
    StopVideoSource,
    SwitchCamera,
    ChangeCaptureFormat(CaptureFormat),
    SendMessage(ApplicationMessage),
    DataChannelOpen,
    Close,
}

// ============================================================================
// WEBRTC ENGINE
// ============================================================================

/// Media Engine über `webrtc`
pub struct WebRtcEngine {
    commands: mpsc::UnboundedSender<EngineCommand>,
    closed: AtomicBool,
}

impl WebRtcEngine {
    /// Erstellt die Engine und startet den Worker
    ///
    /// Muss innerhalb einer Tokio-Runtime aufgerufen werden.
    pub fn new(parameters: PeerConnectionParameters, events: Arc<dyn ConnectionEvents>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let worker = EngineWorker::new(parameters, events, commands.downgrade());
        tokio::spawn(worker.run(rx));

        Self {
            commands,
            closed: AtomicBool::new(false),
        }
    }

    fn submit(&self, command: EngineCommand) {
        if self.closed.load(Ordering::SeqCst) || self.commands.send(command).is_err() {
            tracing::debug!("Engine closed, dropping command");
        }
    }
}

impl MediaEngineAdapter for WebRtcEngine {
    fn create_connection(
        &self,
        local_sink: Arc<dyn VideoSink>,
        remote_sinks: Vec<Arc<dyn VideoSink>>,
        capturer: Option<Arc<dyn VideoCapturer>>,
        params: &SignalingParameters,
    ) {
        self.submit(EngineCommand::CreateConnection {
            local_sink,
            remote_sinks,
            capturer,
            params: params.clone(),
        });
    }

    fn create_offer(&self) {
        self.submit(EngineCommand::CreateOffer);
    }

    fn create_answer(&self) {
        self.submit(EngineCommand::CreateAnswer);
    }

    fn set_remote_description(&self, desc: SessionDescription) {
        self.submit(EngineCommand::SetRemoteDescription(desc));
    }

    fn add_remote_ice_candidate(&self, candidate: IceCandidate) {
        self.submit(EngineCommand::AddRemoteCandidate(candidate));
    }

    fn remove_remote_ice_candidates(&self, candidates: Vec<IceCandidate>) {
        self.submit(EngineCommand::RemoveRemoteCandidates(candidates));
    }

    fn enable_statistics(&self, enabled: bool, period: Duration) {
        self.submit(EngineCommand::EnableStatistics { enabled, period });
    }

    fn set_max_video_bitrate(&self, kbps: u32) {
        self.submit(EngineCommand::SetMaxVideoBitrate(kbps));
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.submit(EngineCommand::SetAudioEnabled(enabled));
    }

    fn start_video_source(&self) {
        self.submit(EngineCommand::StartVideoSource);
    }

    fn stop_video_source(&self) {
        self.submit(EngineCommand::StopVideoSource);
    }

    fn switch_camera(&self) {
        self.submit(EngineCommand::SwitchCamera);
    }

    fn change_capture_format(&self, format: CaptureFormat) {
        self.submit(EngineCommand::ChangeCaptureFormat(format));
    }

    fn send_application_message(&self, message: ApplicationMessage) {
        self.submit(EngineCommand::SendMessage(message));
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.commands.send(EngineCommand::Close);
    }
}

impl std::fmt::Debug for WebRtcEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcEngine")
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

// ============================================================================
// WORKER
// ============================================================================

/// Verteilt Capture-Frames an die lokale Vorschau und den Video-Track
struct CaptureFanout {
    local: Arc<dyn VideoSink>,
    tx: mpsc::Sender<VideoFrame>,
}

impl VideoSink for CaptureFanout {
    fn on_frame(&self, frame: &VideoFrame) {
        self.local.on_frame(frame);
        if self.tx.try_send(frame.clone()).is_err() {
            tracing::trace!("Video track busy, dropping frame");
        }
    }
}

struct EngineWorker {
    parameters: PeerConnectionParameters,
    events: Arc<dyn ConnectionEvents>,
    commands: mpsc::WeakUnboundedSender<EngineCommand>,

    pc: Option<Arc<RTCPeerConnection>>,
    data_channel: Option<Arc<RTCDataChannel>>,
    audio_track: Option<Arc<TrackLocalStaticRTP>>,
    audio_sender: Option<Arc<RTCRtpSender>>,
    capturer: Option<Arc<dyn VideoCapturer>>,
    capture_sink: Option<Arc<dyn VideoSink>>,
    capture_format: CaptureFormat,
    candidates: CandidateFilter,
    pending_outbound: VecDeque<ApplicationMessage>,
    tasks: Vec<JoinHandle<()>>,
    stats_task: Option<JoinHandle<()>>,
}

impl EngineWorker {
    fn new(
        parameters: PeerConnectionParameters,
        events: Arc<dyn ConnectionEvents>,
        commands: mpsc::WeakUnboundedSender<EngineCommand>,
    ) -> Self {
        let capture_format = CaptureFormat::from_params(&parameters);
        Self {
            parameters,
            events,
            commands,
            pc: None,
            data_channel: None,
            audio_track: None,
            audio_sender: None,
            capturer: None,
            capture_sink: None,
            capture_format,
            candidates: CandidateFilter::new(),
            pending_outbound: VecDeque::new(),
            tasks: Vec::new(),
            stats_task: None,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EngineCommand>) {
        while let Some(command) = rx.recv().await {
            let is_close = matches!(command, EngineCommand::Close);
            match self.handle(command).await {
                Ok(()) => {}
                Err(EngineError::Capture(e)) => {
                    tracing::error!("Video capture error: {}", e);
                    self.events.on_capture_error(e.to_string());
                }
                Err(e) => {
                    tracing::error!("Media engine error: {}", e);
                    self.events.on_error(e.to_string());
                }
            }
            if is_close {
                return;
            }
        }

        // Alle Sender verworfen, ohne close()
        self.close().await;
    }

    async fn handle(&mut self, command: EngineCommand) -> Result<(), EngineError> {
        match command {
            EngineCommand::CreateConnection {
                local_sink,
                remote_sinks,
                capturer,
                params,
            } => {
                self.create_connection(local_sink, remote_sinks, capturer, params)
                    .await
            }
            EngineCommand::CreateOffer => {
                let pc = self.connection()?;
                let offer = pc.create_offer(None).await?;
                pc.set_local_description(offer.clone()).await?;
                tracing::debug!("Local offer set");
                self.events
                    .on_local_description(SessionDescription::offer(offer.sdp));
                Ok(())
            }
            EngineCommand::CreateAnswer => {
                let pc = self.connection()?;
                let answer = pc.create_answer(None).await?;
                pc.set_local_description(answer.clone()).await?;
                tracing::debug!("Local answer set");
                self.events
                    .on_local_description(SessionDescription::answer(answer.sdp));
                Ok(())
            }
            EngineCommand::SetRemoteDescription(desc) => self.set_remote_description(desc).await,
            EngineCommand::AddRemoteCandidate(candidate) => {
                match self.candidates.admit(candidate) {
                    Admission::Apply(candidate) => self.apply_candidate(&candidate).await,
                    Admission::Queued => {
                        tracing::debug!("Queueing remote candidate until remote description is set");
                        Ok(())
                    }
                    Admission::Removed => {
                        tracing::debug!("Ignoring previously removed candidate");
                        Ok(())
                    }
                }
            }
            EngineCommand::RemoveRemoteCandidates(batch) => {
                let dropped = self.candidates.remove(&batch);
                tracing::debug!(
                    "Removed {} remote candidates ({} still queued)",
                    batch.len(),
                    dropped
                );
                Ok(())
            }
            EngineCommand::EnableStatistics { enabled, period } => {
                self.enable_statistics(enabled, period);
                Ok(())
            }
            EngineCommand::SetMaxVideoBitrate(kbps) => {
                match &self.capturer {
                    Some(capturer) => {
                        tracing::debug!("Requested max video send bitrate: {} kbps", kbps);
                        capturer.set_max_bitrate(kbps);
                    }
                    None => tracing::debug!("No video source, ignoring max bitrate"),
                }
                Ok(())
            }
            EngineCommand::SetAudioEnabled(enabled) => {
                let Some(sender) = self.audio_sender.clone() else {
                    return Ok(());
                };
                let track = if enabled {
                    self.audio_track
                        .clone()
                        .map(|t| t as Arc<dyn TrackLocal + Send + Sync>)
                } else {
                    None
                };
                sender.replace_track(track).await?;
                tracing::info!("Audio {}", if enabled { "enabled" } else { "muted" });
                Ok(())
            }
            EngineCommand::StartVideoSource => {
                if let (Some(capturer), Some(sink)) = (&self.capturer, &self.capture_sink) {
                    tracing::debug!("Restart video source");
                    capturer.start(self.capture_format, Arc::clone(sink))?;
                }
                Ok(())
            }
            EngineCommand::StopVideoSource => {
                if let Some(capturer) = &self.capturer {
                    tracing::debug!("Stop video source");
                    capturer.stop();
                }
                Ok(())
            }
            EngineCommand::SwitchCamera => {
                if let Some(Err(e)) = self.capturer.as_ref().map(|c| c.switch_camera()) {
                    tracing::warn!("Will not switch camera: {}", e);
                }
                Ok(())
            }
            EngineCommand::ChangeCaptureFormat(format) => {
                if !self.parameters.video_call_enabled {
                    tracing::error!("Failed to change capture format. Video: false");
                    return Ok(());
                }
                self.capture_format = format;
                if let Some(capturer) = &self.capturer {
                    tracing::debug!(
                        "Changing capture format: {}x{}@{}",
                        format.width,
                        format.height,
                        format.fps
                    );
                    capturer.change_format(format);
                }
                Ok(())
            }
            EngineCommand::SendMessage(message) => self.send_message(message).await,
            EngineCommand::DataChannelOpen => {
                let pending: Vec<_> = self.pending_outbound.drain(..).collect();
                if !pending.is_empty() {
                    tracing::debug!("Data channel open, sending {} queued messages", pending.len());
                }
                for message in pending {
                    self.send_message(message).await?;
                }
                Ok(())
            }
            EngineCommand::Close => {
                self.close().await;
                Ok(())
            }
        }
    }

    fn connection(&self) -> Result<Arc<RTCPeerConnection>, EngineError> {
        self.pc.clone().ok_or(EngineError::NoConnection)
    }

    async fn create_connection(
        &mut self,
        local_sink: Arc<dyn VideoSink>,
        remote_sinks: Vec<Arc<dyn VideoSink>>,
        capturer: Option<Arc<dyn VideoCapturer>>,
        params: SignalingParameters,
    ) -> Result<(), EngineError> {
        if self.pc.is_some() {
            return Err(EngineError::AlreadyCreated);
        }

        tracing::debug!("Create peer connection");

        let mut media_engine = MediaEngine::default();
        media_engine.register_codec(
            audio_codec_parameters(
                &self.parameters.audio_codec,
                self.parameters.audio_start_bitrate_kbps,
            ),
            RTPCodecType::Audio,
        )?;
        let video_codec = video_codec_parameters(&self.parameters.video_codec);
        media_engine.register_codec(video_codec.clone(), RTPCodecType::Video)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers_from(&params.ice_servers),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await?);
        // Sofort übernehmen, damit close() auch nach Fehlern im Aufbau schließt
        self.pc = Some(Arc::clone(&pc));
        self.setup_peer_connection_handlers(&pc, remote_sinks);

        // Audio Track
        let audio_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "ARDAMSa0".to_string(),
            STREAM_ID.to_string(),
        ));
        let audio_sender = pc
            .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        self.tasks.push(drain_rtcp(Arc::clone(&audio_sender)));
        self.audio_track = Some(audio_track);
        self.audio_sender = Some(audio_sender);

        // Video Track
        if self.parameters.video_call_enabled {
            match capturer {
                Some(capturer) => {
                    let video_track = Arc::new(TrackLocalStaticSample::new(
                        video_codec.capability,
                        "ARDAMSv0".to_string(),
                        STREAM_ID.to_string(),
                    ));
                    let video_sender = pc
                        .add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
                        .await?;
                    self.tasks.push(drain_rtcp(video_sender));

                    let (tx, mut rx) = mpsc::channel::<VideoFrame>(FRAME_QUEUE_SIZE);
                    self.tasks.push(tokio::spawn(async move {
                        while let Some(frame) = rx.recv().await {
                            let sample = Sample {
                                data: frame.data,
                                duration: frame.duration,
                                ..Default::default()
                            };
                            if let Err(e) = video_track.write_sample(&sample).await {
                                tracing::warn!("Failed to write video sample: {}", e);
                            }
                        }
                    }));

                    let sink: Arc<dyn VideoSink> = Arc::new(CaptureFanout {
                        local: local_sink,
                        tx,
                    });
                    capturer.start(self.capture_format, Arc::clone(&sink))?;
                    self.capture_sink = Some(sink);
                    self.capturer = Some(capturer);
                }
                None => {
                    pc.add_transceiver_from_kind(
                        RTPCodecType::Video,
                        Some(RTCRtpTransceiverInit {
                            direction: RTCRtpTransceiverDirection::Recvonly,
                            send_encodings: vec![],
                        }),
                    )
                    .await?;
                }
            }
        }

        // Data Channel
        if let Some(dc_params) = &self.parameters.data_channel {
            let dc = pc
                .create_data_channel(DATA_CHANNEL_LABEL, Some(data_channel_init(dc_params)))
                .await?;
            self.setup_data_channel(&dc);
            self.data_channel = Some(dc);
        }

        tracing::debug!("Peer connection created");
        Ok(())
    }

    /// Registriert Event Handler für die Peer Connection
    fn setup_peer_connection_handlers(
        &self,
        pc: &Arc<RTCPeerConnection>,
        remote_sinks: Vec<Arc<dyn VideoSink>>,
    ) {
        let events = Arc::clone(&self.events);
        pc.on_ice_candidate(Box::new(move |candidate| {
            match candidate.map(|c| c.to_json()) {
                Some(Ok(init)) => events.on_ice_candidate(candidate_from_init(init)),
                Some(Err(e)) => tracing::warn!("Failed to serialize local candidate: {}", e),
                None => tracing::debug!("ICE gathering complete"),
            }
            Box::pin(async {})
        }));

        let events = Arc::clone(&self.events);
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            tracing::debug!("IceConnectionState: {}", state);
            match state {
                RTCIceConnectionState::Connected => events.on_ice_connected(),
                RTCIceConnectionState::Disconnected => events.on_ice_disconnected(),
                RTCIceConnectionState::Failed => {
                    events.on_error("ICE connection failed.".to_string())
                }
                _ => {}
            }
            Box::pin(async {})
        }));

        let events = Arc::clone(&self.events);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            tracing::debug!("PeerConnectionState: {}", state);
            match state {
                RTCPeerConnectionState::Connected => events.on_connected(),
                RTCPeerConnectionState::Disconnected => events.on_disconnected(),
                RTCPeerConnectionState::Failed => {
                    events.on_error("DTLS connection failed.".to_string())
                }
                _ => {}
            }
            Box::pin(async {})
        }));

        let events = Arc::clone(&self.events);
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            tracing::debug!("New data channel {}", dc.label());
            register_message_handler(&dc, Arc::clone(&events));
            Box::pin(async {})
        }));

        pc.on_track(Box::new(move |track, _, _| {
            let sinks = remote_sinks.clone();
            Box::pin(async move {
                tracing::info!("Received remote {} track", track.kind());
                if track.kind() != RTPCodecType::Video {
                    return;
                }
                while let Ok((packet, _)) = track.read_rtp().await {
                    let frame = VideoFrame {
                        data: packet.payload,
                        duration: Duration::ZERO,
                        timestamp: packet.header.timestamp,
                    };
                    for sink in &sinks {
                        sink.on_frame(&frame);
                    }
                }
                tracing::debug!("Remote video track ended");
            })
        }));
    }

    fn setup_data_channel(&self, dc: &Arc<RTCDataChannel>) {
        register_message_handler(dc, Arc::clone(&self.events));

        let commands = self.commands.clone();
        dc.on_open(Box::new(move || {
            tracing::debug!("Data channel open");
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(EngineCommand::DataChannelOpen);
            }
            Box::pin(async {})
        }));
    }

    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<(), EngineError> {
        let pc = self.connection()?;
        let remote = match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(|e| EngineError::InvalidSdp(e.to_string()))?;

        pc.set_remote_description(remote).await?;
        tracing::debug!("Remote SDP set successfully");

        let queued = self.candidates.release();
        if !queued.is_empty() {
            tracing::debug!("Add {} remote candidates", queued.len());
        }
        for candidate in queued {
            self.apply_candidate(&candidate).await?;
        }
        Ok(())
    }

    async fn apply_candidate(&self, candidate: &IceCandidate) -> Result<(), EngineError> {
        let pc = self.connection()?;
        pc.add_ice_candidate(candidate_init(candidate)).await?;
        Ok(())
    }

    fn enable_statistics(&mut self, enabled: bool, period: Duration) {
        if let Some(task) = self.stats_task.take() {
            task.abort();
        }
        if !enabled {
            return;
        }
        let Some(pc) = self.pc.clone() else {
            tracing::warn!("Statistics requested without peer connection");
            return;
        };

        let events = Arc::clone(&self.events);
        self.stats_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let report = pc.get_stats().await;
                events.on_stats_ready(summarize(&report));
            }
        }));
    }

    async fn send_message(&mut self, message: ApplicationMessage) -> Result<(), EngineError> {
        let Some(dc) = self.data_channel.clone() else {
            tracing::warn!("No data channel, dropping '{}' message", message.tag);
            return Ok(());
        };

        if dc.ready_state() != RTCDataChannelState::Open {
            if self.pending_outbound.len() >= PENDING_OUTBOUND_LIMIT {
                tracing::warn!("Data channel not open, dropping '{}' message", message.tag);
            } else {
                self.pending_outbound.push_back(message);
            }
            return Ok(());
        }

        let frame = message
            .encode_frame()
            .map_err(|e| EngineError::DataChannel(e.to_string()))?;
        let result = if frame.is_string {
            dc.send_text(String::from_utf8_lossy(&frame.data).into_owned())
                .await
        } else {
            dc.send(&frame.data).await
        };
        if let Err(e) = result {
            tracing::warn!("Failed to send '{}' message: {}", message.tag, e);
        }
        Ok(())
    }

    async fn close(&mut self) {
        tracing::debug!("Closing peer connection");

        if let Some(task) = self.stats_task.take() {
            task.abort();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.pending_outbound.clear();
        self.capture_sink = None;
        self.capturer = None;
        self.audio_sender = None;
        self.audio_track = None;

        if let Some(dc) = self.data_channel.take() {
            if let Err(e) = dc.close().await {
                tracing::debug!("Data channel close: {}", e);
            }
        }
        if let Some(pc) = self.pc.take() {
            if let Err(e) = pc.close().await {
                tracing::warn!("Peer connection close: {}", e);
            }
        }

        tracing::debug!("Closing peer connection done");
        self.events.on_connection_closed();
    }
}

fn register_message_handler(dc: &Arc<RTCDataChannel>, events: Arc<dyn ConnectionEvents>) {
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        match ApplicationMessage::decode_frame(msg.is_string, msg.data) {
            Ok(message) => events.on_application_message(message),
            Err(e) => tracing::warn!("Dropping malformed data channel frame: {}", e),
        }
        Box::pin(async {})
    }));
}

/// RTCP lesen, damit die Interceptors arbeiten
fn drain_rtcp(sender: Arc<RTCRtpSender>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while sender.read(&mut buf).await.is_ok() {}
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::capture::CaptureError;
    use crate::media::sink::ProxyVideoSink;
    use std::sync::atomic::AtomicUsize;
    use webrtc::peer_connection::signaling_state::RTCSignalingState;

    fn candidate(sdp: &str) -> IceCandidate {
        IceCandidate::new("0", 0, sdp)
    }

    #[test]
    fn test_candidates_queue_until_remote_description() {
        let mut filter = CandidateFilter::new();
        assert_eq!(filter.admit(candidate("a")), Admission::Queued);
        assert_eq!(filter.admit(candidate("b")), Admission::Queued);

        assert_eq!(filter.release(), vec![candidate("a"), candidate("b")]);
        assert_eq!(filter.admit(candidate("c")), Admission::Apply(candidate("c")));
    }

    #[test]
    fn test_removed_candidates_never_apply_again() {
        let mut filter = CandidateFilter::new();
        filter.release();

        assert_eq!(filter.admit(candidate("a")), Admission::Apply(candidate("a")));
        filter.remove(&[candidate("a"), candidate("b")]);

        assert_eq!(filter.admit(candidate("a")), Admission::Removed);
        assert_eq!(filter.admit(candidate("b")), Admission::Removed);
        assert_eq!(filter.admit(candidate("c")), Admission::Apply(candidate("c")));
    }

    #[test]
    fn test_removal_drops_queued_candidates() {
        let mut filter = CandidateFilter::new();
        filter.admit(candidate("a"));
        filter.admit(candidate("b"));

        assert_eq!(filter.remove(&[candidate("a")]), 1);
        assert_eq!(filter.release(), vec![candidate("b")]);
    }

    #[test]
    fn test_video_codec_preferences() {
        assert_eq!(video_codec_parameters("VP8").capability.mime_type, MIME_TYPE_VP8);
        assert_eq!(video_codec_parameters("VP9").payload_type, 98);

        let high = video_codec_parameters("H264 High");
        assert_eq!(high.capability.mime_type, MIME_TYPE_H264);
        assert!(high.capability.sdp_fmtp_line.contains("profile-level-id=640c1f"));

        let fallback = video_codec_parameters("AV2");
        assert_eq!(fallback.capability.mime_type, MIME_TYPE_VP8);
    }

    #[test]
    fn test_audio_start_bitrate() {
        let codec = audio_codec_parameters("OPUS", 32);
        assert!(codec
            .capability
            .sdp_fmtp_line
            .ends_with("maxaveragebitrate=32000"));

        let codec = audio_codec_parameters("OPUS", 0);
        assert!(!codec.capability.sdp_fmtp_line.contains("maxaveragebitrate"));
    }

    #[test]
    fn test_data_channel_init() {
        let mut params = DataChannelParameters::default();
        params.ordered = false;
        params.max_retransmits = Some(3);
        params.protocol = "telemetry".to_string();

        let init = data_channel_init(&params);
        assert_eq!(init.ordered, Some(false));
        assert_eq!(init.max_retransmits, Some(3));
        assert_eq!(init.protocol.as_deref(), Some("telemetry"));
        assert_eq!(init.negotiated, None);

        params.negotiated = true;
        params.channel_id = Some(7);
        assert_eq!(data_channel_init(&params).negotiated, Some(7));
    }

    #[test]
    fn test_ice_servers_fallback() {
        assert_eq!(ice_servers_from(&[])[0].urls, default_ice_servers()[0].urls);

        let servers = ice_servers_from(&[IceServer {
            urls: vec!["turn:turn.example.org:3478".to_string()],
            username: "user".to_string(),
            credential: "secret".to_string(),
        }]);
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].username, "user");
    }

    #[test]
    fn test_candidate_conversion() {
        let local = IceCandidate::new("audio", 1, "candidate:1 1 UDP 2122252543 10.0.0.2 5000 typ host");
        assert_eq!(candidate_from_init(candidate_init(&local)), local);
    }

    /// Zählt nur das Abschluss-Ereignis
    #[derive(Default)]
    struct ClosingEvents {
        closed: AtomicUsize,
    }

    impl ConnectionEvents for ClosingEvents {
        fn on_local_description(&self, _desc: SessionDescription) {}
        fn on_ice_candidate(&self, _candidate: IceCandidate) {}
        fn on_ice_candidates_removed(&self, _candidates: Vec<IceCandidate>) {}
        fn on_ice_connected(&self) {}
        fn on_ice_disconnected(&self) {}
        fn on_connected(&self) {}
        fn on_disconnected(&self) {}
        fn on_connection_closed(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
        fn on_stats_ready(&self, _stats: StatsSnapshot) {}
        fn on_application_message(&self, _message: ApplicationMessage) {}
        fn on_error(&self, _description: String) {}
        fn on_capture_error(&self, _description: String) {}
    }

    /// Quelle, die sich nicht öffnen lässt
    struct BrokenCapturer;

    impl VideoCapturer for BrokenCapturer {
        fn start(&self, _format: CaptureFormat, _sink: Arc<dyn VideoSink>) -> Result<(), CaptureError> {
            Err(CaptureError::Unavailable("camera busy".into()))
        }
        fn stop(&self) {}
        fn change_format(&self, _format: CaptureFormat) {}
    }

    #[tokio::test]
    async fn test_close_after_failed_setup_closes_peer_connection() {
        let events = Arc::new(ClosingEvents::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut worker = EngineWorker::new(
            PeerConnectionParameters::default(),
            events.clone(),
            tx.downgrade(),
        );

        let params = SignalingParameters {
            initiator: true,
            client_id: "client".to_string(),
            room_id: "room".to_string(),
            offer_sdp: None,
            ice_candidates: Vec::new(),
            ice_servers: Vec::new(),
        };
        let capturer: Arc<dyn VideoCapturer> = Arc::new(BrokenCapturer);
        let result = worker
            .create_connection(
                Arc::new(ProxyVideoSink::new()),
                Vec::new(),
                Some(capturer),
                params,
            )
            .await;
        assert!(matches!(result, Err(EngineError::Capture(_))));

        let pc = worker.pc.clone().expect("peer connection kept after failed setup");
        worker.close().await;

        assert!(worker.pc.is_none());
        assert_eq!(pc.signaling_state(), RTCSignalingState::Closed);
        assert_eq!(events.closed.load(Ordering::SeqCst), 1);
    }
}
