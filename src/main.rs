//! Kommandozeilen-Lauf einer Session ohne Oberfläche
//!
//! Aufruf: `peer-session [config.json]`. Ohne Datei wird die Konfiguration
//! aus der Umgebung gelesen (`ROOM_URL`, `ROOM_ID`, ...).

use anyhow::Context;
use peer_session::media::LoggingAudioRouter;
use peer_session::messaging::{StreamPayload, StreamTag};
use peer_session::session::log_notifications;
use peer_session::{init_logging, Collaborators, HeadlessUi, SessionConfig, SessionOrchestrator};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = match std::env::args().nth(1) {
        Some(path) => SessionConfig::from_json_file(&path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => SessionConfig::from_env().context("Failed to load config from environment")?,
    };
    tracing::info!(
        "Starting session for room '{}' via {}",
        config.room.room_id,
        config.room.room_url
    );

    let collaborators = Collaborators::webrtc(
        &config,
        None,
        Arc::new(LoggingAudioRouter::new()),
        Arc::new(HeadlessUi::new()),
    );
    let (mut orchestrator, handle) = SessionOrchestrator::new(config, collaborators);

    for stream in StreamTag::ALL {
        orchestrator.register_stream_handler(
            stream,
            |stream: StreamTag, payload: StreamPayload| match payload {
                StreamPayload::Text(text) => tracing::info!("[{}] {}", stream, text),
                StreamPayload::Coordinates(values) => {
                    tracing::info!("[{}] {} values", stream, values.len())
                }
            },
        );
    }

    tokio::spawn(log_notifications(handle.subscribe()));

    let shutdown = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, shutting down");
            shutdown.shutdown();
        }
    });

    handle.start_call(None);
    let outcome = orchestrator.run().await;

    match &outcome.error {
        Some(error) => {
            tracing::error!("Session ended in {}: {}", outcome.final_state, error);
            anyhow::bail!("session failed: {}", error)
        }
        None => {
            let duration = outcome
                .call_duration
                .map(|d| format!("{}s", d.num_seconds()))
                .unwrap_or_else(|| "never connected".to_string());
            tracing::info!("Session ended in {} ({})", outcome.final_state, duration);
            Ok(())
        }
    }
}
