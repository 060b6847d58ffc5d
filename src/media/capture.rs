//! Lokale Videoquellen
//!
//! Die eigentlichen Geräte liegen außerhalb dieser Crate. Hier wird nur
//! entschieden, welche Quelle verwendet wird, und wie die Engine mit ihr
//! spricht.
//!
//! Priorität: eigene Quelle > Videodatei > Bildschirm > Kamera.

use super::sink::VideoSink;
use crate::config::{CaptureSettings, PeerConnectionParameters};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Standardauflösung wenn keine konfiguriert ist
pub const DEFAULT_WIDTH: u32 = 1280;
pub const DEFAULT_HEIGHT: u32 = 720;
pub const DEFAULT_FPS: u32 = 30;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("User didn't give permission to capture the screen.")]
    PermissionDenied,

    #[error("Camera2 only supports capturing to texture. Either disable Camera2 or enable capturing to texture in the options.")]
    TextureRequired,

    #[error("Failed to open video file {0}")]
    FileUnavailable(PathBuf),

    #[error("Capture device unavailable: {0}")]
    Unavailable(String),

    #[error("Capture failed: {0}")]
    Failed(String),
}

// ============================================================================
// TYPES
// ============================================================================

/// Auflösung und Bildrate einer Quelle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl CaptureFormat {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self { width, height, fps }
    }

    /// Format aus den Verbindungsparametern, 0 bedeutet Standardwert
    pub fn from_params(params: &PeerConnectionParameters) -> Self {
        let non_zero = |value: u32, default: u32| if value == 0 { default } else { value };
        Self {
            width: non_zero(params.video_width, DEFAULT_WIDTH),
            height: non_zero(params.video_height, DEFAULT_HEIGHT),
            fps: non_zero(params.video_fps, DEFAULT_FPS),
        }
    }
}

impl Default for CaptureFormat {
    fn default() -> Self {
        Self::new(DEFAULT_WIDTH, DEFAULT_HEIGHT, DEFAULT_FPS)
    }
}

/// Ergebnis der Bildschirmfreigabe-Anfrage
///
/// Wird beim Start des Anrufs als Wert übergeben.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScreenCaptureGrant {
    Granted { token: String },
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraApi {
    Camera1,
    Camera2,
}

/// Welche Quelle geöffnet werden soll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureRequest {
    /// Vom Host bereitgestellte Quelle
    Custom,
    File(PathBuf),
    Screen { token: String },
    Camera { api: CameraApi, to_texture: bool },
}

impl CaptureRequest {
    pub fn is_screen(&self) -> bool {
        matches!(self, CaptureRequest::Screen { .. })
    }
}

/// Wählt die Quelle nach fester Priorität
pub fn select_capture_request(
    settings: &CaptureSettings,
    screen_grant: Option<&ScreenCaptureGrant>,
) -> Result<CaptureRequest, CaptureError> {
    if settings.custom_source {
        return Ok(CaptureRequest::Custom);
    }

    if let Some(path) = &settings.video_file {
        return Ok(CaptureRequest::File(path.clone()));
    }

    if settings.screencapture {
        return match screen_grant {
            Some(ScreenCaptureGrant::Granted { token }) => Ok(CaptureRequest::Screen {
                token: token.clone(),
            }),
            _ => Err(CaptureError::PermissionDenied),
        };
    }

    if settings.camera2 {
        if !settings.capture_to_texture {
            return Err(CaptureError::TextureRequired);
        }
        return Ok(CaptureRequest::Camera {
            api: CameraApi::Camera2,
            to_texture: true,
        });
    }

    Ok(CaptureRequest::Camera {
        api: CameraApi::Camera1,
        to_texture: settings.capture_to_texture,
    })
}

// ============================================================================
// TRAITS
// ============================================================================

/// Eine geöffnete Videoquelle
///
/// Die Quelle liefert Frames an die beim Start übergebene Sink, bis `stop`
/// aufgerufen wird. `stop` muss idempotent sein.
pub trait VideoCapturer: Send + Sync {
    fn start(&self, format: CaptureFormat, sink: Arc<dyn VideoSink>) -> Result<(), CaptureError>;
    fn stop(&self);
    fn change_format(&self, format: CaptureFormat);
    /// Nur Kameras können wechseln
    fn switch_camera(&self) -> Result<(), CaptureError> {
        Err(CaptureError::Unavailable("source cannot switch cameras".into()))
    }
    /// Obergrenze für den Encoder in kbps
    fn set_max_bitrate(&self, _kbps: u32) {}
}

/// Öffnet Quellen für eine `CaptureRequest`
pub trait CapturerFactory: Send + Sync {
    fn create(
        &self,
        request: &CaptureRequest,
        hw_acceleration: bool,
    ) -> Result<Arc<dyn VideoCapturer>, CaptureError>;
}

// ============================================================================
// TESTS
// ============================================================================
