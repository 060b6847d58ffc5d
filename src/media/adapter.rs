//! Schnittstelle zwischen Session und Media Engine
//!
//! Alle Methoden von `MediaEngineAdapter` kehren sofort zurück. Ergebnisse
//! (lokale Beschreibung, Kandidaten, Zustandswechsel) kommen später über
//! `ConnectionEvents` zurück.

use super::capture::{CaptureError, CaptureFormat, VideoCapturer};
use super::sink::VideoSink;
use crate::messaging::ApplicationMessage;
use crate::signaling::{IceCandidate, SessionDescription, SignalingParameters};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("No peer connection")]
    NoConnection,

    #[error("Peer connection already created")]
    AlreadyCreated,

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Data channel error: {0}")]
    DataChannel(String),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),
}

impl From<webrtc::Error> for EngineError {
    fn from(e: webrtc::Error) -> Self {
        EngineError::WebRTC(e.to_string())
    }
}

// ============================================================================
// STATISTICS
// ============================================================================

/// Zusammenfassung eines Statistik-Berichts
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub report_count: usize,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl StatsSnapshot {
    pub fn empty() -> Self {
        Self {
            taken_at: Utc::now(),
            report_count: 0,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }
}

// ============================================================================
// TRAITS
// ============================================================================

/// Ereignisse der Media Engine
///
/// Werden aus den internen Tasks der Engine aufgerufen.
pub trait ConnectionEvents: Send + Sync {
    fn on_local_description(&self, desc: SessionDescription);
    fn on_ice_candidate(&self, candidate: IceCandidate);
    fn on_ice_candidates_removed(&self, candidates: Vec<IceCandidate>);
    fn on_ice_connected(&self);
    fn on_ice_disconnected(&self);
    /// Transport ist sicher und kann Daten übertragen
    fn on_connected(&self);
    fn on_disconnected(&self);
    fn on_connection_closed(&self);
    fn on_stats_ready(&self, stats: StatsSnapshot);
    fn on_application_message(&self, message: ApplicationMessage);
    fn on_error(&self, description: String);
    /// Lokale Videoquelle ist ausgefallen
    fn on_capture_error(&self, description: String);
}

/// Die Media Engine aus Sicht der Session
pub trait MediaEngineAdapter: Send + Sync {
    fn create_connection(
        &self,
        local_sink: Arc<dyn VideoSink>,
        remote_sinks: Vec<Arc<dyn VideoSink>>,
        capturer: Option<Arc<dyn VideoCapturer>>,
        params: &SignalingParameters,
    );
    fn create_offer(&self);
    fn create_answer(&self);
    fn set_remote_description(&self, desc: SessionDescription);
    fn add_remote_ice_candidate(&self, candidate: IceCandidate);
    /// Entfernt alle Kandidaten des Batches in einem Schritt
    fn remove_remote_ice_candidates(&self, candidates: Vec<IceCandidate>);
    fn enable_statistics(&self, enabled: bool, period: Duration);
    fn set_max_video_bitrate(&self, kbps: u32);
    fn set_audio_enabled(&self, enabled: bool);
    fn start_video_source(&self);
    fn stop_video_source(&self);
    fn switch_camera(&self);
    fn change_capture_format(&self, format: CaptureFormat);
    fn send_application_message(&self, message: ApplicationMessage);
    /// Idempotent; meldet danach `on_connection_closed`
    fn close(&self);
}

// ============================================================================
// TEST SUPPORT
// ============================================================================
