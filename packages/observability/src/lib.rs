//! Structured logging for the NGOBRAS sync tools.
//!
//! Libraries only emit `tracing` events. A binary calls [`init`] or
//! [`init_with_config`] once and every event is appended as one JSON object
//! per line to `~/.ngobras/logs/sync.jsonl` (see [`LogEntry`] for the shape).
//! Several processes may share that file; each line is flushed on its own.
//!
//! ```rust,ignore
//! observability::init_with_config(observability::LogConfig {
//!     service_name: "ngobras-sync".into(),
//!     default_level: "debug".into(),
//!     also_stderr: true,
//!     ..Default::default()
//! });
//! ```

mod file_sink;
mod json_layer;

use std::path::PathBuf;

pub use file_sink::{default_log_path, CentralLogWriter};
pub use json_layer::{JsonLayer, LogEntry};
pub use tracing::Level;

/// Logging setup for one process.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Written into the `service` field of every line.
    pub service_name: String,
    /// Filter used when `RUST_LOG` is unset.
    pub default_level: String,
    /// Overrides [`default_log_path`].
    pub log_path: Option<PathBuf>,
    /// Mirror events to stderr in compact form.
    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "ngobras".into(),
            default_level: "info".into(),
            log_path: None,
            also_stderr: false,
        }
    }
}

/// Install logging for `service_name` with default settings.
pub fn init(service_name: &str) {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        ..Default::default()
    });
}

/// Install logging. When the log file cannot be opened the process still
/// gets stderr output.
pub fn init_with_config(config: LogConfig) {
    let Err(err) = file_sink::init_file_subscriber(&config) else {
        return;
    };
    use tracing_subscriber::util::SubscriberInitExt;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(file_sink::env_filter(&config.default_level))
        .compact()
        .with_writer(std::io::stderr)
        .finish()
        .try_init();
    tracing::warn!(error = %err, "Log file unavailable, using stderr");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.service_name, "ngobras");
        assert_eq!(config.default_level, "info");
        assert!(config.log_path.is_none());
        assert!(!config.also_stderr);
    }
}
