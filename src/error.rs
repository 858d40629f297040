//! Error types for the ET-Bus hub

use thiserror::Error;

use crate::protocol::CodecError;

/// Result type alias for hub operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the ET-Bus hub
///
/// Only setup paths (config loading, socket open, start/stop) return these.
/// Steady-state traffic never surfaces an error to callers: send failures
/// are logged and dropped, malformed datagrams are discarded.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Envelope could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Transport could not be opened or used
    #[error("transport error: {0}")]
    Transport(String),

    /// Endpoint cannot carry out the requested command
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// Operation requires a started hub
    #[error("hub is not running")]
    NotStarted,

    /// `start()` called on a hub that is already running
    #[error("hub is already running")]
    AlreadyStarted,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
