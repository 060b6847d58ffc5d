//! Message Types für das Signaling-Protokoll
//!
//! Enthält die gemeinsamen Datentypen (Session Descriptions, ICE Candidates,
//! Signaling-Parameter) und die Wire-Strukturen für den Raum-Server.

use serde::{Deserialize, Serialize};

// ============================================================================
// SHARED TYPES
// ============================================================================

/// Typ einer Session Description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl SdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
        }
    }
}

impl std::fmt::Display for SdpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lokale oder entfernte Session Description (Offer/Answer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE Candidate im AppRTC-Format (`id`, `label`, `candidate`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    #[serde(rename = "id")]
    pub sdp_mid: String,
    #[serde(rename = "label")]
    pub sdp_mline_index: u16,
    #[serde(rename = "candidate")]
    pub sdp: String,
}

impl IceCandidate {
    pub fn new(sdp_mid: impl Into<String>, sdp_mline_index: u16, sdp: impl Into<String>) -> Self {
        Self {
            sdp_mid: sdp_mid.into(),
            sdp_mline_index,
            sdp: sdp.into(),
        }
    }
}

/// STUN/TURN Server aus der Raum-Antwort
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Parameter, die beim Betreten des Raums empfangen werden
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingParameters {
    pub initiator: bool,
    pub client_id: String,
    pub room_id: String,
    pub offer_sdp: Option<SessionDescription>,
    pub ice_candidates: Vec<IceCandidate>,
    pub ice_servers: Vec<IceServer>,
}

impl SignalingParameters {
    /// Baut die Parameter aus den im Raum gespeicherten Nachrichten
    ///
    /// Das erste gespeicherte Offer wird zur `offer_sdp`, gespeicherte
    /// Candidates werden in Reihenfolge übernommen. Ein gespeicherter
    /// Removal-Batch entfernt seine Candidates wieder aus der Liste.
    /// Andere Nachrichten werden ignoriert.
    pub fn from_stored_messages(
        room_id: String,
        client_id: String,
        initiator: bool,
        messages: Vec<PeerMessage>,
        ice_servers: Vec<IceServer>,
    ) -> Self {
        let mut offer_sdp = None;
        let mut ice_candidates = Vec::new();

        for message in messages {
            match message {
                PeerMessage::Offer { sdp } if offer_sdp.is_none() => {
                    offer_sdp = Some(SessionDescription::offer(sdp));
                }
                PeerMessage::Candidate(candidate) => ice_candidates.push(candidate),
                PeerMessage::RemoveCandidates { candidates } => {
                    let before = ice_candidates.len();
                    ice_candidates.retain(|c| !candidates.contains(c));
                    tracing::debug!(
                        "Stored removal batch withdrew {} of {} candidates",
                        before - ice_candidates.len(),
                        candidates.len()
                    );
                }
                other => {
                    tracing::debug!("Ignoring stored room message: {:?}", other);
                }
            }
        }

        Self {
            initiator,
            client_id,
            room_id,
            offer_sdp,
            ice_candidates,
            ice_servers,
        }
    }
}

// ============================================================================
// PEER MESSAGES (relayed between the two clients)
// ============================================================================

/// Nachrichten, die unverändert zwischen den Peers weitergereicht werden
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PeerMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate(IceCandidate),
    RemoveCandidates { candidates: Vec<IceCandidate> },
    Bye,
}

impl PeerMessage {
    pub fn from_description(desc: &SessionDescription) -> Self {
        match desc.sdp_type {
            SdpType::Offer => PeerMessage::Offer {
                sdp: desc.sdp.clone(),
            },
            SdpType::Answer => PeerMessage::Answer {
                sdp: desc.sdp.clone(),
            },
        }
    }
}

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

/// Basis für alle Client-Nachrichten
#[derive(Debug, Clone, Serialize)]
pub struct StampedMessage<T: Serialize> {
    #[serde(flatten)]
    pub payload: T,
    pub timestamp: i64,
}

impl<T: Serialize> StampedMessage<T> {
    pub fn now(payload: T) -> Self {
        Self {
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Raum betreten
#[derive(Debug, Clone, Serialize)]
pub struct JoinPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "roomId")]
    pub room_id: String,
    pub loopback: bool,
}

impl JoinPayload {
    pub fn new(room_id: String, loopback: bool) -> Self {
        Self {
            msg_type: "join",
            room_id,
            loopback,
        }
    }
}

/// Nachricht an den anderen Peer weiterleiten
#[derive(Debug, Clone, Serialize)]
pub struct RelayPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "roomId")]
    pub room_id: String,
    #[serde(rename = "clientId")]
    pub client_id: String,
    pub message: PeerMessage,
}

impl RelayPayload {
    pub fn new(room_id: String, client_id: String, message: PeerMessage) -> Self {
        Self {
            msg_type: "relay",
            room_id,
            client_id,
            message,
        }
    }
}

/// Raum verlassen
#[derive(Debug, Clone, Serialize)]
pub struct LeavePayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "roomId")]
    pub room_id: String,
    #[serde(rename = "clientId")]
    pub client_id: String,
}

impl LeavePayload {
    pub fn new(room_id: String, client_id: String) -> Self {
        Self {
            msg_type: "leave",
            room_id,
            client_id,
        }
    }
}

/// Heartbeat
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "clientId")]
    pub client_id: String,
}

impl HeartbeatPayload {
    pub fn new(client_id: String) -> Self {
        Self {
            msg_type: "heartbeat",
            client_id,
        }
    }
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Alle möglichen Server-Nachrichten
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Raum betreten
    Joined {
        #[serde(rename = "clientId")]
        client_id: String,
        #[serde(rename = "isInitiator")]
        is_initiator: bool,
        #[serde(default)]
        messages: Vec<PeerMessage>,
        #[serde(default, rename = "iceServers")]
        ice_servers: Vec<IceServer>,
    },

    /// Weitergeleitete Nachricht vom anderen Peer
    Relay { message: PeerMessage },

    /// Raum wurde geschlossen oder der Peer hat ihn verlassen
    Bye {
        #[serde(default)]
        reason: Option<String>,
    },

    /// Fehler
    Error { code: i32, message: String },

    /// Heartbeat Antwort
    Pong {
        #[serde(default)]
        timestamp: i64,
    },
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_wire_format() {
        let message = PeerMessage::Candidate(IceCandidate::new("0", 0, "candidate:1 1 udp"));
        let json = serde_json::to_value(&message).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "type": "candidate",
                "id": "0",
                "label": 0,
                "candidate": "candidate:1 1 udp"
            })
        );
    }

    #[test]
    fn test_remove_candidates_wire_format() {
        let json = r#"{"type":"remove-candidates","candidates":[{"id":"audio","label":1,"candidate":"c"}]}"#;
        let message: PeerMessage = serde_json::from_str(json).unwrap();

        assert_eq!(
            message,
            PeerMessage::RemoveCandidates {
                candidates: vec![IceCandidate::new("audio", 1, "c")]
            }
        );
    }

    #[test]
    fn test_stamped_relay_payload() {
        let payload = RelayPayload::new(
            "room".to_string(),
            "client".to_string(),
            PeerMessage::Answer {
                sdp: "v=0".to_string(),
            },
        );
        let json = serde_json::to_value(StampedMessage::now(payload)).unwrap();

        assert_eq!(json["type"], "relay");
        assert_eq!(json["roomId"], "room");
        assert_eq!(json["message"]["type"], "answer");
        assert!(json["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_joined_with_stored_messages() {
        let json = r#"{
            "type": "joined",
            "clientId": "c2",
            "isInitiator": false,
            "messages": [
                {"type": "candidate", "id": "0", "label": 0, "candidate": "early"},
                {"type": "offer", "sdp": "v=0 offer"}
            ],
            "iceServers": [{"urls": ["stun:stun.example.org:3478"]}]
        }"#;

        let ServerMessage::Joined {
            client_id,
            is_initiator,
            messages,
            ice_servers,
        } = serde_json::from_str::<ServerMessage>(json).unwrap()
        else {
            panic!("expected joined message");
        };

        let params = SignalingParameters::from_stored_messages(
            "room".to_string(),
            client_id,
            is_initiator,
            messages,
            ice_servers,
        );

        assert!(!params.initiator);
        assert_eq!(params.offer_sdp, Some(SessionDescription::offer("v=0 offer")));
        assert_eq!(params.ice_candidates, vec![IceCandidate::new("0", 0, "early")]);
        assert_eq!(params.ice_servers.len(), 1);
    }

    #[test]
    fn test_stored_removals_withdraw_candidates() {
        let withdrawn = IceCandidate::new("0", 0, "candidate:withdrawn");
        let kept = IceCandidate::new("0", 0, "candidate:kept");
        let messages = vec![
            PeerMessage::Offer {
                sdp: "v=0 offer".to_string(),
            },
            PeerMessage::Candidate(withdrawn.clone()),
            PeerMessage::Candidate(kept.clone()),
            PeerMessage::RemoveCandidates {
                candidates: vec![withdrawn.clone()],
            },
        ];

        let params = SignalingParameters::from_stored_messages(
            "room".to_string(),
            "c2".to_string(),
            false,
            messages,
            Vec::new(),
        );

        assert!(!params.ice_candidates.contains(&withdrawn));
        assert_eq!(params.ice_candidates, vec![kept]);
    }

    #[test]
    fn test_bye_without_reason() {
        let message: ServerMessage = serde_json::from_str(r#"{"type":"bye"}"#).unwrap();
        assert!(matches!(message, ServerMessage::Bye { reason: None }));
    }
}
