//! Media Module - Peer Connection, Videoquellen und Audio-Routing
//!
//! Dieses Modul verwaltet:
//! - Die Schnittstelle zur Media Engine (`MediaEngineAdapter`)
//! - Die WebRTC-Implementierung (`WebRtcEngine`)
//! - Austauschbare Video Sinks
//! - Auswahl der Videoquelle
//! - Audio-Routing über den Host

mod adapter;
mod audio;
mod capture;
mod engine;
mod sink;

pub use adapter::{ConnectionEvents, EngineError, MediaEngineAdapter, StatsSnapshot};
pub use audio::{AudioError, AudioRouter, AudioSettings, LoggingAudioRouter};
pub use capture::{
    select_capture_request, CameraApi, CaptureError, CaptureFormat, CaptureRequest,
    CapturerFactory, ScreenCaptureGrant, VideoCapturer,
};
pub use engine::{default_ice_servers, WebRtcEngine, DATA_CHANNEL_LABEL};
pub use sink::{ProxyVideoSink, VideoFrame, VideoSink};

#[cfg(test)]
pub(crate) use sink::tests::CountingSink;
#[cfg(test)]
pub(crate) use adapter::test_support;
