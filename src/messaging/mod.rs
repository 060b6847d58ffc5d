//! Messaging Module - Anwendungsnachrichten auf dem Data Channel
//!
//! - Rahmenformat der Nachrichten (Text und Koordinaten)
//! - Router für die Streams text, score, finger1, finger2 und expand

mod message;
mod router;

pub use message::{
    ApplicationMessage, CoordinateStream, MessageError, MessageKind, StreamTag, WireFrame,
};
pub use router::{MessageRouter, RouterError, StreamHandler, StreamPayload, BACKLOG_CAPACITY};
