//! Peer Session - Orchestrierung von P2P-Videoanrufen
//!
//! Eine Session für WebRTC-Anrufe mit:
//! - Signaling über WebSocket-Raum oder direkte TCP-Verbindung
//! - WebRTC für Audio, Video und einen Data Channel
//! - Telemetrie-Streams (Text, Score, Fingerkoordinaten) über den Data Channel
//! - Einer Zustandsmaschine auf einer einzigen Control Queue

pub mod config;
pub mod media;
pub mod messaging;
pub mod session;
pub mod signaling;

pub use config::{ConfigError, SessionConfig};
pub use session::{
    CallUi, Collaborators, HeadlessUi, SessionError, SessionHandle, SessionNotification,
    SessionOrchestrator, SessionOutcome, SessionState,
};

use once_cell::sync::OnceCell;

// ============================================================================
// LOGGING
// ============================================================================

static LOGGING: OnceCell<()> = OnceCell::new();

/// Initialisiert das Logging einmalig pro Prozess
///
/// `RUST_LOG` wird berücksichtigt; ohne Angabe gilt
/// `peer_session=debug,webrtc=warn`.
pub fn init_logging() {
    LOGGING.get_or_init(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("peer_session=debug,webrtc=warn"));

        if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
            tracing::debug!("Global subscriber already installed");
        }
    });
}
