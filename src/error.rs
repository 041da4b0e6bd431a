//! # Error Handling
//!
//! This module defines the error taxonomy for the streaming client and how errors
//! from the libraries we depend on are folded into it.
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Result<T, E> Type
//! - **Purpose**: Forces every caller to decide what happens on failure
//! - **No exceptions**: A failed asset read or a dropped socket is just a value
//!
//! ### Enums for Error Types
//! - **Variants**: Each variant is one failure class with its own policy
//! - **Pattern matching**: The dispatcher `match`es on the variant to decide
//!   whether a session is dropped, ignored, or stopped
//!
//! ### Traits for Error Conversion
//! - **From trait**: Lets `?` convert library errors automatically
//! - **Display trait**: Defines how errors are formatted in log lines
//!
//! ## Propagation policy:
//! No variant is fatal to the process once it is running. Asset and registry
//! errors are local to session setup; transport errors stop one session's
//! emission chain and are reported to the metrics sink.

use std::fmt;
use std::path::PathBuf;

/// Custom error types for the application.
///
/// ## Error Categories:
/// - **AssetLoad**: A segment file is missing, unreadable or empty
/// - **DuplicateSession**: A session id was announced twice
/// - **Transport**: The connection refused or lost an outbound event
/// - **Config**: Configuration could not be loaded or failed validation
/// - **Protocol**: The peer sent a packet we could not parse
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::DuplicateSession("abc".to_string()));
/// ```
#[derive(Debug)]
pub enum AppError {
    /// A required audio segment could not be read
    AssetLoad {
        /// Path of the segment that failed
        path: PathBuf,
        /// What went wrong while reading it
        reason: String,
    },

    /// A session with this id is already registered
    DuplicateSession(String),

    /// Connection or emit failure
    Transport(String),

    /// Configuration file or environment variable problems
    Config(String),

    /// Malformed packet received from the peer
    Protocol(String),
}

impl AppError {
    /// Short machine-readable name, used as a metrics key and a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::AssetLoad { .. } => "asset_load",
            AppError::DuplicateSession(_) => "duplicate_session",
            AppError::Transport(_) => "transport",
            AppError::Config(_) => "config",
            AppError::Protocol(_) => "protocol",
        }
    }
}

/// Implementation of the Display trait for AppError.
///
/// ## Purpose:
/// Log lines print errors with `%err`, so this is the text an operator sees.
impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::AssetLoad { path, reason } => {
                write!(f, "Asset load error: {}: {}", path.display(), reason)
            }
            AppError::DuplicateSession(id) => write!(f, "Session '{}' already exists", id),
            AppError::Transport(msg) => write!(f, "Transport error: {}", msg),
            AppError::Config(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Automatic conversion from JSON errors to AppError.
///
/// ## Why Protocol:
/// Every JSON document we parse comes from the peer, so a parse failure means
/// the peer spoke something we do not understand.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Protocol(format!("JSON parsing error: {}", err))
    }
}

/// Automatic conversion from configuration errors to AppError.
///
/// ## When this happens:
/// - config.toml file has invalid syntax
/// - An `APP_*` environment variable cannot be parsed into its field type
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

/// Automatic conversion from websocket errors to AppError.
impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::Transport(err.to_string())
    }
}

/// Type alias for Results that use our custom error type.
///
/// ## Usage Example:
/// ```rust,ignore
/// async fn load(&self) -> AppResult<Vec<AudioStream>> { ... }
/// ```
pub type AppResult<T> = Result<T, AppError>;
