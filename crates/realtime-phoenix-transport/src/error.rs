//! Phoenix transport error types.

use chat_realtime_sync::SyncError;
use thiserror::Error;

/// Phoenix transport error type.
#[derive(Error, Debug)]
pub enum PhoenixError {
    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Realtime endpoint or API key missing
    #[error("Configuration missing: {0}")]
    Config(String),

    /// Endpoint URL could not be parsed
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Not connected error
    #[error("Not connected to realtime")]
    NotConnected,

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Send error
    #[error("Failed to send message: {0}")]
    Send(String),
}

/// Result type alias using PhoenixError.
pub type PhoenixResult<T> = Result<T, PhoenixError>;

impl From<PhoenixError> for SyncError {
    fn from(err: PhoenixError) -> Self {
        match err {
            PhoenixError::Config(reason) => SyncError::ConfigurationMissing(reason),
            other => SyncError::LibraryUnavailable(other.to_string()),
        }
    }
}
