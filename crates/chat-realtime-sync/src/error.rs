//! Error types for the realtime sync core.
//!
//! None of these escape the subscription manager: push-path failures degrade
//! to polling, polling failures grow the poll interval, and history failures
//! are logged. They are still typed so collaborators can report precisely.

use thiserror::Error;

/// Error type for sync operations and collaborator calls.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Required transport configuration (endpoint URL or credential) is absent.
    #[error("Configuration missing: {0}")]
    ConfigurationMissing(String),

    /// The realtime client could not be brought up after bounded retry.
    #[error("Realtime transport unavailable: {0}")]
    LibraryUnavailable(String),

    /// The push subscription itself was rejected.
    #[error("Subscription to {channel} failed: {reason}")]
    SubscriptionFailed {
        /// Channel name that failed to subscribe.
        channel: String,
        /// Reason reported by the transport.
        reason: String,
    },

    /// A pull-based fetch failed (transport or storage error).
    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    /// Local history could not be read or written.
    #[error("History error: {0}")]
    History(String),

    /// The local user is not a participant of the conversation.
    #[error("Not a participant of conversation {0}")]
    NotParticipant(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The manager was cleaned up while the operation was in flight.
    #[error("Subscription manager closed")]
    Closed,
}

impl SyncError {
    /// True for failures that make the push path unusable (initialize fails
    /// with one of these).
    pub fn is_transport_unavailable(&self) -> bool {
        matches!(
            self,
            SyncError::ConfigurationMissing(_) | SyncError::LibraryUnavailable(_)
        )
    }

    /// True when retrying the same call cannot help.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            SyncError::ConfigurationMissing(_) | SyncError::NotParticipant(_) | SyncError::Closed
        )
    }
}

/// Result type alias using SyncError.
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_unavailable_classification() {
        assert!(SyncError::ConfigurationMissing("url".into()).is_transport_unavailable());
        assert!(SyncError::LibraryUnavailable("timeout".into()).is_transport_unavailable());
        assert!(!SyncError::FetchFailed("500".into()).is_transport_unavailable());
    }

    #[test]
    fn test_permanent_classification() {
        assert!(SyncError::ConfigurationMissing("key".into()).is_permanent());
        assert!(SyncError::Closed.is_permanent());
        assert!(!SyncError::LibraryUnavailable("refused".into()).is_permanent());
    }

    #[test]
    fn test_subscription_failed_display() {
        let err = SyncError::SubscriptionFailed {
            channel: "admin-messages-u1".into(),
            reason: "timed out".into(),
        };
        assert_eq!(
            err.to_string(),
            "Subscription to admin-messages-u1 failed: timed out"
        );
    }
}
