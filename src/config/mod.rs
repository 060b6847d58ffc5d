//! Config Module - Session-Konfiguration
//!
//! Dieses Modul verwaltet:
//! - Raum-Parameter (Signaling-URL, Raum-ID, Loopback)
//! - Peer-Connection-Parameter (Video, Codecs, Bitraten, Audio-Verarbeitung)
//! - Data-Channel-Parameter
//! - Laden aus JSON-Dateien und Umgebungsvariablen

mod parameters;

pub use parameters::{
    CaptureSettings, ConfigError, DataChannelParameters, PeerConnectionParameters,
    RoomConnectionParameters, SessionConfig, DEFAULT_DIRECT_PORT,
};
