//! Schnittstelle zur Oberfläche

use super::error::SessionError;
use crate::media::{VideoFrame, VideoSink};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Die beiden Renderer der Anrufansicht
#[derive(Clone)]
pub struct Renderers {
    pub fullscreen: Arc<dyn VideoSink>,
    pub pip: Arc<dyn VideoSink>,
}

/// Vom Host bereitgestellte Oberfläche
pub trait CallUi: Send + Sync {
    /// `false` wenn niemand einen Fehler bestätigen kann
    fn is_interactive(&self) -> bool;

    /// Zeigt den Fehler an; die Bestätigung kommt als Benutzeraktion zurück
    fn show_error(&self, error: &SessionError);

    fn renderers(&self) -> Renderers;

    fn on_feeds_swapped(&self, _swapped: bool) {}
}

/// Verwirft alle Frames
#[derive(Debug, Default)]
pub struct DiscardingSink {
    frames: AtomicU64,
}

impl DiscardingSink {
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

impl VideoSink for DiscardingSink {
    fn on_frame(&self, _frame: &VideoFrame) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }
}

/// Oberfläche für Kommandozeilen-Läufe
///
/// Fehler werden nur protokolliert und die Session sofort abgebaut.
#[derive(Debug, Default)]
pub struct HeadlessUi {
    fullscreen: Arc<DiscardingSink>,
    pip: Arc<DiscardingSink>,
}

impl HeadlessUi {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CallUi for HeadlessUi {
    fn is_interactive(&self) -> bool {
        false
    }

    fn show_error(&self, error: &SessionError) {
        tracing::error!("Critical error: {}", error);
    }

    fn renderers(&self) -> Renderers {
        Renderers {
            fullscreen: self.fullscreen.clone(),
            pip: self.pip.clone(),
        }
    }
}
