//! Konfigurationsstrukturen für eine Call-Session
//!
//! Alle Werte werden einmalig beim Erstellen der Session übergeben.
//! Eine Neuverhandlung während eines laufenden Anrufs gibt es nicht.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Standard-Port für direkte TCP-Verbindungen (Raum-ID ist eine IP)
pub const DEFAULT_DIRECT_PORT: u16 = 8888;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid room URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// ROOM PARAMETERS
// ============================================================================

/// Parameter für die Verbindung zum Signaling-Raum
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoomConnectionParameters {
    pub room_url: String,
    pub room_id: String,
    pub loopback: bool,
    pub url_parameters: Option<String>,
}

impl Default for RoomConnectionParameters {
    fn default() -> Self {
        Self {
            room_url: "http://localhost:4000/".to_string(),
            room_id: String::new(),
            loopback: false,
            url_parameters: None,
        }
    }
}

impl RoomConnectionParameters {
    pub fn new(room_url: impl Into<String>, room_id: impl Into<String>, loopback: bool) -> Self {
        Self {
            room_url: room_url.into(),
            room_id: room_id.into(),
            loopback,
            url_parameters: None,
        }
    }

    /// WebSocket-Endpunkt des Signaling-Servers (`http` → `ws`, Pfad `/ws`)
    pub fn websocket_url(&self) -> Result<Url, ConfigError> {
        let mut url =
            Url::parse(&self.room_url).map_err(|e| ConfigError::InvalidUrl(e.to_string()))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(ConfigError::InvalidUrl(format!(
                    "unsupported scheme '{}'",
                    other
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| ConfigError::InvalidUrl(format!("cannot use scheme '{}'", scheme)))?;

        let path = format!("{}/ws", url.path().trim_end_matches('/'));
        url.set_path(&path);

        if let Some(query) = self.url_parameters.as_deref() {
            url.set_query(Some(query));
        }

        Ok(url)
    }

    /// Adresse für direkte Verbindungen, falls die Raum-ID eine IP ist
    ///
    /// Akzeptiert `ip` und `ip:port`. Im Loopback-Modus immer `None`.
    pub fn direct_address(&self) -> Option<SocketAddr> {
        if self.loopback {
            return None;
        }
        if let Ok(addr) = self.room_id.parse::<SocketAddr>() {
            return Some(addr);
        }
        self.room_id
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, DEFAULT_DIRECT_PORT))
    }
}

// ============================================================================
// DATA CHANNEL PARAMETERS
// ============================================================================

/// Parameter für den Data Channel der Telemetrie-Streams
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DataChannelParameters {
    pub ordered: bool,
    pub max_retransmit_time_ms: Option<u16>,
    pub max_retransmits: Option<u16>,
    pub protocol: String,
    pub negotiated: bool,
    pub channel_id: Option<u16>,
}

impl Default for DataChannelParameters {
    fn default() -> Self {
        Self {
            ordered: true,
            max_retransmit_time_ms: None,
            max_retransmits: None,
            protocol: String::new(),
            negotiated: false,
            channel_id: None,
        }
    }
}

impl DataChannelParameters {
    /// Geordnet und ohne Retransmit-Limits
    pub fn is_reliable_ordered(&self) -> bool {
        self.ordered && self.max_retransmit_time_ms.is_none() && self.max_retransmits.is_none()
    }
}

// ============================================================================
// PEER CONNECTION PARAMETERS
// ============================================================================

/// Parameter für die Peer Connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PeerConnectionParameters {
    pub video_call_enabled: bool,
    pub video_width: u32,
    pub video_height: u32,
    pub video_fps: u32,
    /// 0 = kein Limit
    pub video_max_bitrate_kbps: u32,
    pub video_codec: String,
    pub video_codec_hw_acceleration: bool,
    /// 0 = Standard des Codecs
    pub audio_start_bitrate_kbps: u32,
    pub audio_codec: String,
    pub no_audio_processing: bool,
    pub disable_built_in_aec: bool,
    pub disable_built_in_agc: bool,
    pub disable_built_in_ns: bool,
    pub data_channel: Option<DataChannelParameters>,
}

impl Default for PeerConnectionParameters {
    fn default() -> Self {
        Self {
            video_call_enabled: true,
            video_width: 0,
            video_height: 0,
            video_fps: 0,
            video_max_bitrate_kbps: 0,
            video_codec: "VP8".to_string(),
            video_codec_hw_acceleration: true,
            audio_start_bitrate_kbps: 0,
            audio_codec: "OPUS".to_string(),
            no_audio_processing: false,
            disable_built_in_aec: false,
            disable_built_in_agc: false,
            disable_built_in_ns: false,
            data_channel: Some(DataChannelParameters::default()),
        }
    }
}

// ============================================================================
// CAPTURE SETTINGS
// ============================================================================

/// Quellen für lokales Video
///
/// Die Reihenfolge der Auswahl ist fest: Custom > Datei > Bildschirm > Kamera.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CaptureSettings {
    pub custom_source: bool,
    pub video_file: Option<PathBuf>,
    pub screencapture: bool,
    pub camera2: bool,
    pub capture_to_texture: bool,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            custom_source: false,
            video_file: None,
            screencapture: false,
            camera2: true,
            capture_to_texture: true,
        }
    }
}

// ============================================================================
// SESSION CONFIG
// ============================================================================

/// Vollständige Konfiguration einer Session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    pub room: RoomConnectionParameters,
    pub peer: PeerConnectionParameters,
    pub capture: CaptureSettings,
    pub stats_period_ms: u64,
    pub heartbeat_interval_secs: u64,
    /// Automatisches Auflegen nach dieser Zeit (Kommandozeilen-Läufe)
    pub run_time_ms: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            room: RoomConnectionParameters::default(),
            peer: PeerConnectionParameters::default(),
            capture: CaptureSettings::default(),
            stats_period_ms: 1000,
            heartbeat_interval_secs: 25,
            run_time_ms: None,
        }
    }
}

impl SessionConfig {
    /// Lädt die Konfiguration aus einer JSON-Datei
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Parst die Konfiguration aus einem JSON-String
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Standard-Konfiguration mit Überschreibungen aus der Umgebung
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Überschreibt Werte aus einer Key-Value-Quelle
    ///
    /// Erkannte Schlüssel: `ROOM_URL`, `ROOM_ID`, `LOOPBACK`, `VIDEO_CALL`,
    /// `VIDEO_CODEC`, `HEADLESS_RUNTIME_MS`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("ROOM_URL") {
            self.room.room_url = url;
        }
        if let Some(room_id) = lookup("ROOM_ID") {
            self.room.room_id = room_id;
        }
        if let Some(value) = lookup("LOOPBACK") {
            self.room.loopback = parse_flag("LOOPBACK", &value)?;
        }
        if let Some(value) = lookup("VIDEO_CALL") {
            self.peer.video_call_enabled = parse_flag("VIDEO_CALL", &value)?;
        }
        if let Some(codec) = lookup("VIDEO_CODEC") {
            self.peer.video_codec = codec;
        }
        if let Some(value) = lookup("HEADLESS_RUNTIME_MS") {
            let ms = value.parse::<u64>().map_err(|_| {
                ConfigError::Invalid(format!("HEADLESS_RUNTIME_MS is not a number: {}", value))
            })?;
            self.run_time_ms = (ms > 0).then_some(ms);
        }
        Ok(())
    }

    /// Prüft die Konsistenz der Konfiguration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.room.room_id.trim().is_empty() {
            return Err(ConfigError::Invalid("room id must not be empty".to_string()));
        }
        if self.room.direct_address().is_none() {
            self.room.websocket_url()?;
        }

        let peer = &self.peer;
        if (peer.video_width == 0) != (peer.video_height == 0) {
            return Err(ConfigError::Invalid(
                "video width and height must be set together".to_string(),
            ));
        }

        if let Some(dc) = &peer.data_channel {
            if dc.negotiated && dc.channel_id.is_none() {
                return Err(ConfigError::Invalid(
                    "negotiated data channel requires a channel id".to_string(),
                ));
            }
        }

        if self.stats_period_ms == 0 {
            return Err(ConfigError::Invalid(
                "stats period must be positive".to_string(),
            ));
        }

        Ok(())
    }

    pub fn stats_period(&self) -> Duration {
        Duration::from_millis(self.stats_period_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn run_time(&self) -> Option<Duration> {
        self.run_time_ms.map(Duration::from_millis)
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid(format!(
            "{} expects a boolean, got '{}'",
            key, value
        ))),
    }
}

// ============================================================================
// TESTS
// ============================================================================
