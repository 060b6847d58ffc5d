//! Application Message Router
//!
//! Serialisiert ausgehende Nachrichten der fünf Streams und verteilt
//! eingehende Nachrichten nach Tag an registrierte Handler.
//!
//! Vor dem Verbindungsaufbau werden ausgehende Nachrichten in einer
//! begrenzten FIFO gepuffert und bei `attach` in Reihenfolge gesendet.

use super::message::{ApplicationMessage, CoordinateStream, MessageKind, StreamTag};
use crate::config::DataChannelParameters;
use crate::media::MediaEngineAdapter;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;

/// Maximale Anzahl gepufferter Nachrichten vor dem Verbindungsaufbau
pub const BACKLOG_CAPACITY: usize = 256;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("No data channel configured")]
    NoDataChannel,

    #[error("Stream '{0}' requires an ordered, reliable data channel")]
    UnreliableChannel(StreamTag),

    #[error("Outbound backlog full ({0} messages)")]
    BacklogFull(usize),

    #[error("Session closed")]
    Closed,
}

// ============================================================================
// HANDLERS
// ============================================================================

/// Dekodierte Nutzlast eines eingehenden Streams
#[derive(Debug, Clone, PartialEq)]
pub enum StreamPayload {
    Text(String),
    Coordinates(Vec<f32>),
}

/// Empfänger eines Streams
pub trait StreamHandler: Send {
    fn handle(&mut self, stream: StreamTag, payload: StreamPayload);
}

impl<F> StreamHandler for F
where
    F: FnMut(StreamTag, StreamPayload) + Send,
{
    fn handle(&mut self, stream: StreamTag, payload: StreamPayload) {
        self(stream, payload)
    }
}

// ============================================================================
// ROUTER
// ============================================================================

enum Outbound {
    Deferred(VecDeque<ApplicationMessage>),
    Attached(Arc<dyn MediaEngineAdapter>),
    Closed,
}

/// Router für die Streams auf dem Data Channel
pub struct MessageRouter {
    channel: Option<DataChannelParameters>,
    handlers: HashMap<StreamTag, Box<dyn StreamHandler>>,
    outbound: Outbound,
    dropped_inbound: u64,
}

impl MessageRouter {
    pub fn new(channel: Option<DataChannelParameters>) -> Self {
        Self {
            channel,
            handlers: HashMap::new(),
            outbound: Outbound::Deferred(VecDeque::new()),
            dropped_inbound: 0,
        }
    }

    /// Registriert einen Handler; ein vorhandener wird ersetzt
    pub fn register(&mut self, stream: StreamTag, handler: impl StreamHandler + 'static) {
        if self.handlers.insert(stream, Box::new(handler)).is_some() {
            tracing::debug!("Replaced handler for stream '{}'", stream);
        }
    }

    pub fn send_text(&mut self, text: &str) -> Result<(), RouterError> {
        self.send(
            StreamTag::Text,
            ApplicationMessage::text(StreamTag::Text.as_str(), text),
        )
    }

    pub fn send_score_annotation(&mut self, text: &str) -> Result<(), RouterError> {
        self.send(
            StreamTag::Score,
            ApplicationMessage::text(StreamTag::Score.as_str(), text),
        )
    }

    /// Sendet die Werte unverändert als f32-Folge
    pub fn send_coordinates(
        &mut self,
        stream: CoordinateStream,
        values: &[f32],
    ) -> Result<(), RouterError> {
        let tag = StreamTag::from(stream);
        self.send(tag, ApplicationMessage::coordinates(tag.as_str(), values))
    }

    fn send(&mut self, stream: StreamTag, message: ApplicationMessage) -> Result<(), RouterError> {
        let channel = self.channel.as_ref().ok_or(RouterError::NoDataChannel)?;
        if stream.is_annotation() && !channel.is_reliable_ordered() {
            return Err(RouterError::UnreliableChannel(stream));
        }

        match &mut self.outbound {
            Outbound::Attached(adapter) => {
                adapter.send_application_message(message);
                Ok(())
            }
            Outbound::Deferred(backlog) => {
                if backlog.len() >= BACKLOG_CAPACITY {
                    return Err(RouterError::BacklogFull(backlog.len()));
                }
                backlog.push_back(message);
                Ok(())
            }
            Outbound::Closed => Err(RouterError::Closed),
        }
    }

    /// Verbindung steht: Puffer in Reihenfolge senden
    pub fn attach(&mut self, adapter: Arc<dyn MediaEngineAdapter>) {
        let previous = std::mem::replace(&mut self.outbound, Outbound::Attached(Arc::clone(&adapter)));
        match previous {
            Outbound::Deferred(backlog) => {
                if !backlog.is_empty() {
                    tracing::debug!("Flushing {} deferred application messages", backlog.len());
                }
                for message in backlog {
                    adapter.send_application_message(message);
                }
            }
            Outbound::Closed => {
                tracing::warn!("attach after detach, router stays closed");
                self.outbound = Outbound::Closed;
            }
            Outbound::Attached(_) => {}
        }
    }

    /// Abbau: Puffer verwerfen, weitere Sendungen ablehnen
    ///
    /// Gibt die Anzahl verworfener Nachrichten zurück.
    pub fn detach(&mut self) -> usize {
        match std::mem::replace(&mut self.outbound, Outbound::Closed) {
            Outbound::Deferred(backlog) if !backlog.is_empty() => {
                tracing::info!("Discarding {} undelivered application messages", backlog.len());
                backlog.len()
            }
            _ => 0,
        }
    }

    pub fn backlog_len(&self) -> usize {
        match &self.outbound {
            Outbound::Deferred(backlog) => backlog.len(),
            _ => 0,
        }
    }

    pub fn dropped_inbound(&self) -> u64 {
        self.dropped_inbound
    }

    /// Verteilt eine eingehende Nachricht
    ///
    /// Gibt `true` zurück, wenn ein Handler sie erhalten hat.
    pub fn dispatch(&mut self, message: ApplicationMessage) -> bool {
        let Some(stream) = StreamTag::from_tag(&message.tag) else {
            tracing::warn!("Dropping message with unknown tag '{}'", message.tag);
            self.dropped_inbound += 1;
            return false;
        };

        let payload = match stream.kind() {
            MessageKind::Text => message.as_text().map(|t| StreamPayload::Text(t.to_string())),
            MessageKind::Binary => message.as_coordinates().map(StreamPayload::Coordinates),
        };
        let payload = match payload {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Dropping malformed '{}' message: {}", stream, e);
                self.dropped_inbound += 1;
                return false;
            }
        };

        match self.handlers.get_mut(&stream) {
            Some(handler) => {
                handler.handle(stream, payload);
                true
            }
            None => {
                tracing::debug!("No handler for stream '{}'", stream);
                false
            }
        }
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let outbound = match &self.outbound {
            Outbound::Deferred(_) => "deferred",
            Outbound::Attached(_) => "attached",
            Outbound::Closed => "closed",
        };
        f.debug_struct("MessageRouter")
            .field("outbound", &outbound)
            .field("backlog", &self.backlog_len())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
