//! Video Sinks
//!
//! Die Session übergibt der Engine nie direkt die Renderer der UI, sondern
//! `ProxyVideoSink`s. Deren Ziel kann zur Laufzeit umgehängt (Feed-Tausch)
//! oder geleert werden; Frames ohne Ziel werden verworfen.

use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Ein kodierter oder roher Video-Frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub data: Bytes,
    pub duration: Duration,
    /// RTP-Zeitstempel bzw. Capture-Zeitstempel
    pub timestamp: u32,
}

/// Empfänger von Video-Frames
pub trait VideoSink: Send + Sync {
    fn on_frame(&self, frame: &VideoFrame);
}

/// Leitet Frames an ein austauschbares Ziel weiter
#[derive(Default)]
pub struct ProxyVideoSink {
    target: RwLock<Option<Arc<dyn VideoSink>>>,
    dropped: AtomicU64,
}

impl ProxyVideoSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Setzt das Ziel; `None` verwirft alle weiteren Frames
    pub fn set_target(&self, target: Option<Arc<dyn VideoSink>>) {
        *self.target.write() = target;
    }

    pub fn has_target(&self) -> bool {
        self.target.read().is_some()
    }

    /// Anzahl verworfener Frames seit Erstellung
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl VideoSink for ProxyVideoSink {
    fn on_frame(&self, frame: &VideoFrame) {
        match self.target.read().as_ref() {
            Some(target) => target.on_frame(frame),
            None => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 {
                    tracing::debug!("Dropping frame, video sink target not set");
                }
            }
        }
    }
}

impl std::fmt::Debug for ProxyVideoSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyVideoSink")
            .field("has_target", &self.has_target())
            .field("dropped", &self.dropped_frames())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Zählt empfangene Frames
    #[derive(Default)]
    pub struct CountingSink {
        pub frames: Mutex<Vec<u32>>,
    }

    impl VideoSink for CountingSink {
        fn on_frame(&self, frame: &VideoFrame) {
            self.frames.lock().push(frame.timestamp);
        }
    }

    fn frame(timestamp: u32) -> VideoFrame {
        VideoFrame {
            data: Bytes::from_static(&[0u8; 4]),
            duration: Duration::from_millis(33),
            timestamp,
        }
    }

    #[test]
    fn test_proxy_forwards_and_retargets() {
        let proxy = ProxyVideoSink::new();
        let first = Arc::new(CountingSink::default());
        let second = Arc::new(CountingSink::default());

        proxy.on_frame(&frame(1));
        assert_eq!(proxy.dropped_frames(), 1);

        proxy.set_target(Some(first.clone()));
        proxy.on_frame(&frame(2));

        proxy.set_target(Some(second.clone()));
        proxy.on_frame(&frame(3));

        proxy.set_target(None);
        proxy.on_frame(&frame(4));

        assert_eq!(*first.frames.lock(), vec![2]);
        assert_eq!(*second.frames.lock(), vec![3]);
        assert_eq!(proxy.dropped_frames(), 2);
    }
}
