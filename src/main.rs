//! # Call Audio Streamer - Main Application Entry Point
//!
//! This is the main entry point for the call-audio-streamer client.
//! It connects to a call platform over Socket.IO and, for every call the
//! platform announces, plays pre-segmented audio into the call once it connects.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: The whole client runs on the tokio runtime
//! - **modules**: Code is organized into separate modules (mod statements)
//! - **Result<T, E>**: Start-up errors end the process with a message
//! - **Arc**: The registry and transport are shared by every session task
//! - **static**: The shutdown flag lives for the entire program duration
//!
//! ## Application Architecture:
//! - **config**: Handles application configuration (TOML files + environment variables)
//! - **state**: Shared configuration and playback metrics
//! - **audio**: Asset loading, per-session playback state, the chunk scheduler
//! - **transport**: The platform connection (Socket.IO over a websocket)
//! - **dispatcher**: Routes inbound platform events to their handlers
//! - **error**: Custom error types

// Module declarations - These tell Rust about our other source files
mod audio;       // Audio loading, sessions and pacing (audio/ directory)
mod config;      // Configuration management (config.rs)
mod dispatcher;  // Inbound event handling (dispatcher.rs)
mod error;       // Error handling types (error.rs)
mod state;       // Application state management (state.rs)
mod transport;   // Platform connection (transport/ directory)

use anyhow::Result;
use audio::loader::FsAssetLoader;
use audio::session::SessionRegistry;
use config::AppConfig;
use dispatcher::EventDispatcher;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::socketio::SocketIoTransport;

/// Set once SIGINT or SIGTERM arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Builds the session registry** over the audio directory
/// 4. **Connects to the call platform** and dispatches its events
/// 5. **Handles graceful shutdown** when receiving system signals
///
/// ## Error Handling:
/// Only start-up can fail the process (bad config, unreachable platform).
/// After that, failures stay inside the session they happened in.
#[tokio::main]
async fn main() -> Result<()> {
    // .ok() means "ignore errors" - it's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting call-audio-streamer v{}", env!("CARGO_PKG_VERSION"));
    info!(
        endpoint = %config.transport.endpoint,
        pacing_ms = config.playback.pacing_delay_ms,
        pacing_mode = ?config.playback.pacing_mode,
        streams = config.assets.streams.len(),
        "Configuration loaded"
    );

    let app_state = AppState::new(config.clone());
    let loader = Arc::new(FsAssetLoader::new(config.assets.root.clone()));
    let registry = Arc::new(SessionRegistry::new(loader, config.assets.streams.clone()));

    setup_signal_handlers();

    let (transport, events) = SocketIoTransport::connect(&config.transport).await?;
    let dispatcher = EventDispatcher::new(registry.clone(), Arc::new(transport), app_state.clone());

    // tokio::select! is like a "race" - whichever finishes first wins
    tokio::select! {
        _ = dispatcher.run(events) => {
            warn!("Connection to call platform ended");
        }
        _ = wait_for_shutdown() => {
            info!(active_sessions = ?registry.active_session_ids(), "Shutdown signal received, stopping...");
        }
    }

    let metrics = app_state.get_metrics_snapshot();
    info!(
        uptime_seconds = app_state.get_uptime_seconds(),
        sessions_created = metrics.sessions_created,
        sessions_retired = metrics.sessions_retired,
        chunks_emitted = metrics.chunks_emitted,
        acks_received = metrics.acks_received,
        errors = metrics.error_count(),
        "Client stopped"
    );
    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "call_audio_streamer=trace")
/// - If not set, defaults to "call_audio_streamer=debug"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "call_audio_streamer=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Set up signal handlers for graceful shutdown.
///
/// Listens for SIGTERM and SIGINT; whichever comes first sets the global
/// shutdown flag. If a handler cannot be installed the client keeps running
/// without it.
fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to install signal handlers: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        // SeqCst (Sequential Consistency) ensures this change is visible to all threads
        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Wait for the shutdown signal to be set.
///
/// Polls the flag every 100ms; sleeping between checks keeps this off the CPU.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
