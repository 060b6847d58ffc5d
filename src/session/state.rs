//! Zustand einer Session

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Lebenszyklus einer Session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Noch kein Anruf gestartet
    Idle,
    /// Verbindung zum Raum wird aufgebaut
    ConnectingSignaling,
    /// Offer/Answer und ICE laufen
    Negotiating,
    /// Transport steht
    Connected,
    /// Abbau läuft
    Disconnecting,
    /// Abgebaut
    Closed,
    /// Abgebrochen nach einem Fehler
    Error,
}

impl SessionState {
    /// Aus diesen Zuständen gibt es keinen Weg zurück
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Error)
    }

    /// Zustände, in denen eine Verbindung existieren kann
    pub fn is_negotiating_or_connected(&self) -> bool {
        matches!(self, SessionState::Negotiating | SessionState::Connected)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "IDLE",
            SessionState::ConnectingSignaling => "CONNECTING_SIGNALING",
            SessionState::Negotiating => "NEGOTIATING",
            SessionState::Connected => "CONNECTED",
            SessionState::Disconnecting => "DISCONNECTING",
            SessionState::Closed => "CLOSED",
            SessionState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Rolle in der Verhandlung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Erstellt das Offer
    Initiator,
    /// Antwortet mit einem Answer
    Responder,
}

impl Role {
    pub fn from_initiator(initiator: bool) -> Self {
        if initiator {
            Role::Initiator
        } else {
            Role::Responder
        }
    }
}

/// Eine Session pro Anrufversuch
///
/// Gehört exklusiv dem Orchestrator.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    /// Steht erst nach dem Raum-Beitritt fest
    pub role: Option<Role>,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub room_id: String,
    pub is_error: bool,
    pub is_connected: bool,
    pub local_description_sent: bool,
    pub remote_description_applied: bool,
    pub connected_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: None,
            state: SessionState::Idle,
            started_at: Utc::now(),
            room_id: room_id.into(),
            is_error: false,
            is_connected: false,
            local_description_sent: false,
            remote_description_applied: false,
            connected_at: None,
        }
    }

    /// Offer und Answer sind ausgetauscht
    pub fn handshake_complete(&self) -> bool {
        self.local_description_sent && self.remote_description_applied
    }

    /// Millisekunden seit Anrufbeginn
    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.started_at).num_milliseconds()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            role: self.role,
            state: self.state,
            room_id: self.room_id.clone(),
            started_at: self.started_at,
            connected_at: self.connected_at,
            is_connected: self.is_connected,
            is_error: self.is_error,
        }
    }
}

/// Lesbare Kopie des Session-Zustands für Timer und UI
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub role: Option<Role>,
    pub state: SessionState,
    pub room_id: String,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub is_connected: bool,
    pub is_error: bool,
}

impl SessionSnapshot {
    /// Dauer seit dem Verbindungsaufbau
    pub fn call_duration(&self) -> Option<chrono::Duration> {
        self.connected_at.map(|at| Utc::now() - at)
    }
}
