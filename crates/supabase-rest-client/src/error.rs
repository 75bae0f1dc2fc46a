//! Error types for PostgREST calls.

use chat_realtime_sync::SyncError;
use thiserror::Error;

/// Error type for the REST client.
///
/// Supports automatic conversion from reqwest and serde_json errors via #[from].
#[derive(Debug, Error)]
pub enum RestClientError {
    /// Network or transport-level HTTP error from reqwest.
    ///
    /// Includes connection failures, timeouts, and TLS errors.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// PostgREST returned a non-success HTTP status.
    ///
    /// Common causes: expired token, RLS policy violation, schema mismatch.
    #[error("Supabase error: {status} - {message}")]
    Supabase {
        /// The HTTP status code returned by Supabase.
        status: u16,
        /// The response body, typically containing error details.
        message: String,
    },

    /// JSON serialization or deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Missing project URL or API key.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An insert asked for the stored row but none came back.
    #[error("Insert returned no rows")]
    EmptyResponse,
}

/// Convenience Result type alias for REST client operations.
pub type RestClientResult<T> = Result<T, RestClientError>;

impl From<RestClientError> for SyncError {
    fn from(err: RestClientError) -> Self {
        match err {
            RestClientError::Config(reason) => SyncError::ConfigurationMissing(reason),
            RestClientError::Json(err) => SyncError::Json(err),
            other => SyncError::FetchFailed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_maps_to_configuration_missing() {
        let err: SyncError = RestClientError::Config("anon key".into()).into();
        assert!(matches!(err, SyncError::ConfigurationMissing(_)));
    }

    #[test]
    fn test_api_error_maps_to_fetch_failed() {
        let err: SyncError = RestClientError::Supabase {
            status: 401,
            message: "JWT expired".into(),
        }
        .into();
        assert_eq!(err.to_string(), "Fetch failed: Supabase error: 401 - JWT expired");
    }
}
