//! Application Messages auf dem Data Channel
//!
//! Rahmenformat:
//! - Text:   Data-Channel-String `"<tag>:<text>"`
//! - Binär:  `[tag_len: u8][tag][f32 big-endian ...]`
//!
//! Es gibt keine Sequenznummern; die Reihenfolge des Kanals ist die einzige
//! Ordnungsgarantie.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("Message has no tag")]
    MissingTag,

    #[error("Tag is not valid UTF-8")]
    InvalidTag,

    #[error("Tag too long: {0} bytes")]
    TagTooLong(usize),

    #[error("Text payload is not valid UTF-8")]
    InvalidText,

    #[error("Coordinate payload length {0} is not a multiple of 4")]
    TruncatedCoordinates(usize),

    #[error("Expected {expected:?} payload for stream '{tag}'")]
    KindMismatch { tag: String, expected: MessageKind },
}

// ============================================================================
// STREAMS
// ============================================================================

/// Art der Nutzlast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    Binary,
}

/// Logische Streams auf dem gemeinsamen Kanal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamTag {
    /// Freitext-Annotationen (Zeichendaten)
    Text,
    /// KI-Bewertungen
    Score,
    /// Erster Finger-Koordinatenstrom
    Finger1,
    /// Zweiter Finger-Koordinatenstrom (Multi-Touch)
    Finger2,
    /// Begrenzungs-/Zoom-Geste
    Expansion,
}

impl StreamTag {
    pub const ALL: [StreamTag; 5] = [
        StreamTag::Text,
        StreamTag::Score,
        StreamTag::Finger1,
        StreamTag::Finger2,
        StreamTag::Expansion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamTag::Text => "text",
            StreamTag::Score => "score",
            StreamTag::Finger1 => "finger1",
            StreamTag::Finger2 => "finger2",
            StreamTag::Expansion => "expand",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|stream| stream.as_str() == tag)
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            StreamTag::Text | StreamTag::Score => MessageKind::Text,
            StreamTag::Finger1 | StreamTag::Finger2 | StreamTag::Expansion => MessageKind::Binary,
        }
    }

    /// Text- und Score-Annotationen brauchen einen zuverlässigen Kanal
    pub fn is_annotation(&self) -> bool {
        self.kind() == MessageKind::Text
    }
}

impl std::fmt::Display for StreamTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Koordinaten-Streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoordinateStream {
    Finger1,
    Finger2,
    Expansion,
}

impl From<CoordinateStream> for StreamTag {
    fn from(stream: CoordinateStream) -> Self {
        match stream {
            CoordinateStream::Finger1 => StreamTag::Finger1,
            CoordinateStream::Finger2 => StreamTag::Finger2,
            CoordinateStream::Expansion => StreamTag::Expansion,
        }
    }
}

// ============================================================================
// APPLICATION MESSAGE
// ============================================================================

/// Ein Rahmen, wie er über den Data Channel geht
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub is_string: bool,
    pub data: Bytes,
}

/// Getaggte Nachricht auf dem Data Channel
///
/// Das Tag wird beim Empfang nicht validiert; unbekannte Tags verwirft erst
/// der Router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationMessage {
    pub kind: MessageKind,
    pub tag: String,
    pub payload: Bytes,
}

impl ApplicationMessage {
    pub fn text(tag: impl Into<String>, text: &str) -> Self {
        Self {
            kind: MessageKind::Text,
            tag: tag.into(),
            payload: Bytes::copy_from_slice(text.as_bytes()),
        }
    }

    pub fn coordinates(tag: impl Into<String>, values: &[f32]) -> Self {
        let mut payload = BytesMut::with_capacity(values.len() * 4);
        for value in values {
            payload.put_f32(*value);
        }
        Self {
            kind: MessageKind::Binary,
            tag: tag.into(),
            payload: payload.freeze(),
        }
    }

    /// Nutzlast als Text
    pub fn as_text(&self) -> Result<&str, MessageError> {
        if self.kind != MessageKind::Text {
            return Err(MessageError::KindMismatch {
                tag: self.tag.clone(),
                expected: MessageKind::Text,
            });
        }
        std::str::from_utf8(&self.payload).map_err(|_| MessageError::InvalidText)
    }

    /// Nutzlast als Folge von f32-Werten
    pub fn as_coordinates(&self) -> Result<Vec<f32>, MessageError> {
        if self.kind != MessageKind::Binary {
            return Err(MessageError::KindMismatch {
                tag: self.tag.clone(),
                expected: MessageKind::Binary,
            });
        }
        if self.payload.len() % 4 != 0 {
            return Err(MessageError::TruncatedCoordinates(self.payload.len()));
        }
        let mut buf = self.payload.clone();
        let mut values = Vec::with_capacity(buf.len() / 4);
        while buf.has_remaining() {
            values.push(buf.get_f32());
        }
        Ok(values)
    }

    /// Kodiert die Nachricht für den Data Channel
    pub fn encode_frame(&self) -> Result<WireFrame, MessageError> {
        if self.tag.is_empty() {
            return Err(MessageError::MissingTag);
        }
        match self.kind {
            MessageKind::Text => {
                let mut data = BytesMut::with_capacity(self.tag.len() + 1 + self.payload.len());
                data.put_slice(self.tag.as_bytes());
                data.put_u8(b':');
                data.put_slice(&self.payload);
                Ok(WireFrame {
                    is_string: true,
                    data: data.freeze(),
                })
            }
            MessageKind::Binary => {
                let tag_len = u8::try_from(self.tag.len())
                    .map_err(|_| MessageError::TagTooLong(self.tag.len()))?;
                let mut data = BytesMut::with_capacity(1 + self.tag.len() + self.payload.len());
                data.put_u8(tag_len);
                data.put_slice(self.tag.as_bytes());
                data.put_slice(&self.payload);
                Ok(WireFrame {
                    is_string: false,
                    data: data.freeze(),
                })
            }
        }
    }

    /// Dekodiert einen empfangenen Rahmen
    pub fn decode_frame(is_string: bool, data: Bytes) -> Result<Self, MessageError> {
        if is_string {
            let separator = data
                .iter()
                .position(|b| *b == b':')
                .filter(|pos| *pos > 0)
                .ok_or(MessageError::MissingTag)?;
            let tag = std::str::from_utf8(&data[..separator])
                .map_err(|_| MessageError::InvalidTag)?
                .to_string();
            Ok(Self {
                kind: MessageKind::Text,
                tag,
                payload: data.slice(separator + 1..),
            })
        } else {
            let tag_len = *data.first().ok_or(MessageError::MissingTag)? as usize;
            if tag_len == 0 || data.len() < 1 + tag_len {
                return Err(MessageError::MissingTag);
            }
            let tag = std::str::from_utf8(&data[1..1 + tag_len])
                .map_err(|_| MessageError::InvalidTag)?
                .to_string();
            Ok(Self {
                kind: MessageKind::Binary,
                tag,
                payload: data.slice(1 + tag_len..),
            })
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
