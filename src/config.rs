//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nested keys)
//! - The two variables the call platform hands out: `SOCKET_SERVER` and `API_KEY`
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Converts between Rust structs and TOML / environment data
//! - **derive macros**: Generate Debug, Clone, Serialize, Deserialize for us
//! - **Result<T, E>**: Loading can fail, and the caller has to deal with it
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `SOCKET_SERVER` / `API_KEY`
//! 2. Environment variables (APP_TRANSPORT__ENDPOINT, APP_PLAYBACK__PACING_DELAY_MS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// The transport, the pacing policy and the asset set change for different
/// reasons, so each gets its own table in config.toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub transport: TransportConfig,
    pub playback: PlaybackConfig,
    pub assets: AssetsConfig,
}

/// Connection settings for the call platform.
///
/// ## Fields:
/// - `endpoint`: Base URL of the Socket.IO server (`http://`, `https://`, `ws://` or `wss://`)
/// - `auth_token`: Credential sent in the Socket.IO connect packet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub endpoint: String,
    pub auth_token: String,
}

/// How the scheduler decides when the next chunk may go out.
///
/// ## Variants:
/// - `Timer`: next chunk fires a fixed delay after the previous emission was issued
/// - `Ack`: next chunk additionally waits for the peer to acknowledge the previous one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PacingMode {
    #[default]
    Timer,
    Ack,
}

/// Playback timing and the side-channel signals sent once a call connects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Delay between consecutive chunk emissions (milliseconds)
    pub pacing_delay_ms: u64,
    /// Delay between the "Connected" dial status and the DTMF signal (milliseconds)
    pub dtmf_delay_ms: u64,
    pub pacing_mode: PacingMode,
    /// How long a chunk's acknowledgment is waited for (milliseconds)
    pub ack_timeout_ms: u64,
    /// Keypad digit sent as the DTMF signal
    pub dtmf_digit: String,
    /// Tone duration carried in the DTMF payload (milliseconds)
    pub dtmf_duration_ms: u64,
}

/// One ordered audio stream to load for every session.
///
/// Segments are read from `{root}/{format}/output_{index:03}.{extension}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSpec {
    pub format: String,
    pub total_count: usize,
    pub extension: String,
}

/// Where the audio segments live and which streams make up a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetsConfig {
    pub root: PathBuf,
    /// Streams in playback order
    pub streams: Vec<StreamSpec>,
}

/// Provides default configuration values.
///
/// ## Why these defaults:
/// A typical platform call: one 180-segment
/// `pcm16` stream, a chunk every 100ms, DTMF "5" three seconds after connect.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig {
                endpoint: "http://127.0.0.1:3000".to_string(),
                auth_token: String::new(),
            },
            playback: PlaybackConfig {
                pacing_delay_ms: 100,
                dtmf_delay_ms: 3000,
                pacing_mode: PacingMode::Timer,
                ack_timeout_ms: 5000,
                dtmf_digit: "5".to_string(),
                dtmf_duration_ms: 200,
            },
            assets: AssetsConfig {
                root: PathBuf::from("./audio"),
                streams: vec![StreamSpec {
                    format: "pcm16".to_string(),
                    total_count: 180,
                    extension: "pcm".to_string(),
                }],
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Apply `SOCKET_SERVER` and `API_KEY` if they are set
    ///
    /// ## Environment Variable Examples:
    /// - `APP_TRANSPORT__ENDPOINT=wss://calls.example.com`
    /// - `APP_PLAYBACK__PACING_DELAY_MS=20`
    /// - `APP_PLAYBACK__PACING_MODE=ack`
    /// - `SOCKET_SERVER=https://calls.example.com`
    /// - `API_KEY=secret`
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(endpoint) = env::var("SOCKET_SERVER") {
            settings = settings.set_override("transport.endpoint", endpoint)?;
        }

        if let Ok(token) = env::var("API_KEY") {
            settings = settings.set_override("transport.auth_token", token)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - The endpoint is set and uses http(s) or ws(s)
    /// - The pacing delay is not zero (zero would flood the peer)
    /// - The ack timeout is not zero
    /// - There is at least one stream and each names a format and an extension
    /// - The DTMF digit is a single keypad character
    ///
    /// A stream with `total_count = 0` is allowed; the scheduler skips it.
    pub fn validate(&self) -> Result<()> {
        if self.transport.endpoint.trim().is_empty() {
            return Err(anyhow::anyhow!("Transport endpoint cannot be empty"));
        }

        crate::transport::socketio::socket_url(&self.transport.endpoint)?;

        if self.playback.pacing_delay_ms == 0 {
            return Err(anyhow::anyhow!("Pacing delay must be greater than 0"));
        }

        if self.playback.ack_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Ack timeout must be greater than 0"));
        }

        if self.assets.streams.is_empty() {
            return Err(anyhow::anyhow!("At least one audio stream must be configured"));
        }

        for spec in &self.assets.streams {
            if spec.format.trim().is_empty() || spec.extension.trim().is_empty() {
                return Err(anyhow::anyhow!(
                    "Audio stream needs both a format and an extension: {:?}",
                    spec
                ));
            }
        }

        let mut digits = self.playback.dtmf_digit.chars();
        match (digits.next(), digits.next()) {
            (Some(c), None) if c.is_ascii_digit() || matches!(c, '*' | '#' | 'A'..='D') => {}
            _ => {
                return Err(anyhow::anyhow!(
                    "DTMF digit must be one keypad character, got '{}'",
                    self.playback.dtmf_digit
                ))
            }
        }

        Ok(())
    }
}

impl PlaybackConfig {
    pub fn pacing_delay(&self) -> Duration {
        Duration::from_millis(self.pacing_delay_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn dtmf_delay(&self) -> Duration {
        Duration::from_millis(self.dtmf_delay_ms)
    }
}
