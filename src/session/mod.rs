//! Session Module - Zustandsmaschine eines Anrufs
//!
//! Dieses Modul verwaltet:
//! - Den Lebenszyklus einer Session (IDLE bis CLOSED/ERROR)
//! - Die Control Queue und ihre drei Event-Sinks
//! - Die Schnittstelle zur Oberfläche

mod error;
mod events;
mod orchestrator;
mod state;
mod ui;

#[cfg(test)]
mod tests;

pub use error::SessionError;
pub use events::{
    log_notifications, ConnectionEvent, ConnectionEventSink, SessionEvent, SessionHandle,
    SessionNotification, SignalingEvent, SignalingEventSink, UserAction,
};
pub use orchestrator::{
    Collaborators, EngineFactory, SessionOrchestrator, SessionOutcome, SignalingFactory,
};
pub use state::{Role, Session, SessionSnapshot, SessionState};
pub use ui::{CallUi, DiscardingSink, HeadlessUi, Renderers};
