//! Audio-Routing
//!
//! Geräteauswahl und Wiedergabe übernimmt der Host. Die Session startet das
//! Routing beim Anrufbeginn und stoppt es genau einmal beim Abbau.

use crate::config::PeerConnectionParameters;
use parking_lot::Mutex;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Audio routing already active")]
    AlreadyStarted,

    #[error("Audio routing failed: {0}")]
    RoutingFailed(String),
}

// ============================================================================
// SETTINGS
// ============================================================================

/// Audioverarbeitung für den Anruf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSettings {
    pub processing_enabled: bool,
    pub echo_cancellation: bool,
    pub auto_gain_control: bool,
    pub noise_suppression: bool,
}

impl AudioSettings {
    pub fn from_params(params: &PeerConnectionParameters) -> Self {
        let processing = !params.no_audio_processing;
        Self {
            processing_enabled: processing,
            echo_cancellation: processing && !params.disable_built_in_aec,
            auto_gain_control: processing && !params.disable_built_in_agc,
            noise_suppression: processing && !params.disable_built_in_ns,
        }
    }
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self::from_params(&PeerConnectionParameters::default())
    }
}

// ============================================================================
// AUDIO ROUTER
// ============================================================================

/// Vom Host bereitgestelltes Audio-Routing
pub trait AudioRouter: Send + Sync {
    fn start(&self, settings: AudioSettings) -> Result<(), AudioError>;
    /// Idempotent
    fn stop(&self);
}

/// Routing ohne Gerät, protokolliert nur
///
/// Für Headless-Läufe, in denen der Host kein Audio verwaltet.
#[derive(Debug, Default)]
pub struct LoggingAudioRouter {
    active: Mutex<Option<AudioSettings>>,
}

impl LoggingAudioRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.lock().is_some()
    }
}

impl AudioRouter for LoggingAudioRouter {
    fn start(&self, settings: AudioSettings) -> Result<(), AudioError> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(AudioError::AlreadyStarted);
        }
        tracing::info!(
            "Audio routing started (aec: {}, agc: {}, ns: {})",
            settings.echo_cancellation,
            settings.auto_gain_control,
            settings.noise_suppression
        );
        *active = Some(settings);
        Ok(())
    }

    fn stop(&self) {
        if self.active.lock().take().is_some() {
            tracing::info!("Audio routing stopped");
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
