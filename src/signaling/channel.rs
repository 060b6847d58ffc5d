//! Schnittstellen zwischen Signaling-Kanal und Session
//!
//! Der Kanal wird von der Session gesteuert (`SignalingChannel`) und meldet
//! eingehende Ereignisse über `SignalingEvents` zurück.

use super::messages::{IceCandidate, PeerMessage, SessionDescription, SignalingParameters};
use crate::config::RoomConnectionParameters;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("Signaling connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Sending {0} in non connected state")]
    NotConnected(&'static str),

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Unexpected signaling message: {0}")]
    UnexpectedMessage(String),

    #[error("Server error: {code} - {message}")]
    ServerError { code: i32, message: String },
}

// ============================================================================
// TRAITS
// ============================================================================

/// Ereignisse, die ein Signaling-Kanal an die Session meldet
///
/// Alle Methoden dürfen aus beliebigen Tasks aufgerufen werden.
pub trait SignalingEvents: Send + Sync {
    fn on_connected_to_room(&self, params: SignalingParameters);
    fn on_remote_description(&self, desc: SessionDescription);
    fn on_remote_ice_candidate(&self, candidate: IceCandidate);
    fn on_remote_ice_candidates_removed(&self, candidates: Vec<IceCandidate>);
    fn on_channel_close(&self);
    fn on_channel_error(&self, description: String);
}

/// Ausgehende Seite eines Signaling-Kanals
///
/// Alle Methoden kehren sofort zurück; Ergebnisse kommen als
/// `SignalingEvents` zurück.
pub trait SignalingChannel: Send + Sync {
    fn connect_to_room(&self, params: RoomConnectionParameters);
    fn send_offer_sdp(&self, desc: SessionDescription);
    fn send_answer_sdp(&self, desc: SessionDescription);
    fn send_local_ice_candidate(&self, candidate: IceCandidate);
    fn send_local_ice_candidate_removals(&self, candidates: Vec<IceCandidate>);
    /// Idempotent
    fn disconnect_from_room(&self);
}

/// Leitet eine Peer-Nachricht an die passende Event-Methode weiter
pub(crate) fn dispatch_peer_message(message: PeerMessage, events: &dyn SignalingEvents) {
    match message {
        PeerMessage::Offer { sdp } => events.on_remote_description(SessionDescription::offer(sdp)),
        PeerMessage::Answer { sdp } => {
            events.on_remote_description(SessionDescription::answer(sdp))
        }
        PeerMessage::Candidate(candidate) => events.on_remote_ice_candidate(candidate),
        PeerMessage::RemoveCandidates { candidates } => {
            events.on_remote_ice_candidates_removed(candidates)
        }
        PeerMessage::Bye => events.on_channel_close(),
    }
}

// ============================================================================
// TEST SUPPORT
// ============================================================================

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tokio::sync::mpsc;

    /// Aufgezeichnetes Signaling-Ereignis
    #[derive(Debug, Clone, PartialEq)]
    pub enum Recorded {
        Connected(SignalingParameters),
        RemoteDescription(SessionDescription),
        RemoteCandidate(IceCandidate),
        RemoteCandidatesRemoved(Vec<IceCandidate>),
        Close,
        Error(String),
    }

    /// Schreibt alle Ereignisse in einen Channel
    pub struct RecordingEvents {
        tx: mpsc::UnboundedSender<Recorded>,
    }

    impl RecordingEvents {
        pub fn new() -> (Self, mpsc::UnboundedReceiver<Recorded>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (Self { tx }, rx)
        }
    }

    impl SignalingEvents for RecordingEvents {
        fn on_connected_to_room(&self, params: SignalingParameters) {
            let _ = self.tx.send(Recorded::Connected(params));
        }
        fn on_remote_description(&self, desc: SessionDescription) {
            let _ = self.tx.send(Recorded::RemoteDescription(desc));
        }
        fn on_remote_ice_candidate(&self, candidate: IceCandidate) {
            let _ = self.tx.send(Recorded::RemoteCandidate(candidate));
        }
        fn on_remote_ice_candidates_removed(&self, candidates: Vec<IceCandidate>) {
            let _ = self.tx.send(Recorded::RemoteCandidatesRemoved(candidates));
        }
        fn on_channel_close(&self) {
            let _ = self.tx.send(Recorded::Close);
        }
        fn on_channel_error(&self, description: String) {
            let _ = self.tx.send(Recorded::Error(description));
        }
    }

    /// Wartet höchstens fünf Sekunden auf das nächste Ereignis
    pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<Recorded>) -> Recorded {
        tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for signaling event")
            .expect("event channel closed")
    }
}
