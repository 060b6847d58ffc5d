//! Signaling Module - Raum-Beitritt und Offer/Answer/Candidate-Austausch
//!
//! Dieses Modul verwaltet die Kommunikation mit dem anderen Peer vor dem
//! Aufbau der direkten Verbindung:
//! - WebSocket-Client für den Raum-Server
//! - Direkter TCP-Kanal, wenn die Raum-ID eine IP-Adresse ist
//! - Nachrichten-Typen und gemeinsame Datentypen
//!

mod channel;
mod client;
mod direct;
mod messages;

pub use channel::{SignalingChannel, SignalingError, SignalingEvents};
pub use client::WebSocketSignalingClient;
pub use direct::DirectSignalingClient;
pub use messages::*;

use crate::config::SessionConfig;
use std::sync::Arc;

/// Wählt den passenden Signaling-Kanal für die Raum-Parameter
///
/// Direkte TCP-Verbindung, wenn die Raum-ID eine IP ist und kein Loopback
/// aktiv ist, sonst WebSocket.
pub fn create_client(
    config: &SessionConfig,
    events: Arc<dyn SignalingEvents>,
) -> Box<dyn SignalingChannel> {
    if config.room.direct_address().is_some() {
        tracing::info!("Using direct signaling because room name looks like an IP");
        Box::new(DirectSignalingClient::new(events))
    } else {
        Box::new(WebSocketSignalingClient::new(
            events,
            config.heartbeat_interval(),
        ))
    }
}
