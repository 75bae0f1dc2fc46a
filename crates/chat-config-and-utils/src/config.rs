//! Configuration management for the sync tools.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use url::Url;

/// Default Supabase URL (can be overridden at compile time via SUPABASE_URL env var).
pub const DEFAULT_SUPABASE_URL: &str = match option_env!("SUPABASE_URL") {
    Some(url) => url,
    None => "https://ngobras.supabase.co",
};

/// Default Supabase anon key (can be overridden at compile time via SUPABASE_ANON_KEY env var).
/// Empty means "not configured": the realtime transport refuses to start without it.
pub const DEFAULT_SUPABASE_ANON_KEY: &str = match option_env!("SUPABASE_ANON_KEY") {
    Some(key) => key,
    None => "",
};

/// Default deployment URL of the web app, used to pick the transport.
pub const DEFAULT_APP_URL: &str = match option_env!("NGOBRAS_APP_URL") {
    Some(url) => url,
    None => "http://localhost:3000",
};

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Which delivery path the subscription manager may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Decide from the deployment hostname (push only on development hosts).
    #[default]
    Auto,
    /// Always attempt push delivery.
    Push,
    /// Never attempt push delivery.
    Polling,
}

impl FromStr for TransportMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "push" | "realtime" => Ok(Self::Push),
            "polling" | "poll" => Ok(Self::Polling),
            other => Err(CoreError::Config(format!("unknown transport mode: {other}"))),
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Auto => "auto",
            Self::Push => "push",
            Self::Polling => "polling",
        };
        f.write_str(name)
    }
}

/// Tunables for realtime delivery, reconnection and polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeSettings {
    /// Transport selection policy.
    pub transport_mode: TransportMode,
    /// Reconnection attempts before falling back to polling for the session.
    pub max_retries: u32,
    /// Base delay for reconnect backoff, in milliseconds.
    pub reconnect_base_delay_ms: u64,
    /// Ceiling for reconnect backoff, in milliseconds.
    pub reconnect_max_delay_ms: u64,
    /// Base polling interval, in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum polling interval after repeated failures, in milliseconds.
    pub poll_max_interval_ms: u64,
    /// Interval multiplier applied on each failed poll.
    pub poll_growth_factor: f64,
    /// How many times transport initialization is attempted.
    pub init_attempts: u32,
    /// Fixed delay between initialization attempts, in milliseconds.
    pub init_retry_delay_ms: u64,
    /// Window within which an optimistic message matches its stored copy, in milliseconds.
    pub optimistic_match_window_ms: u64,
    /// Realtime socket heartbeat interval, in seconds.
    pub heartbeat_interval_secs: u64,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            transport_mode: TransportMode::Auto,
            max_retries: 5,
            reconnect_base_delay_ms: 2_000,
            reconnect_max_delay_ms: 30_000,
            poll_interval_ms: 5_000,
            poll_max_interval_ms: 20_000,
            poll_growth_factor: 1.5,
            init_attempts: 5,
            init_retry_delay_ms: 1_000,
            optimistic_match_window_ms: 10_000,
            heartbeat_interval_secs: 30,
        }
    }
}

impl RealtimeSettings {
    /// Reject settings that would break the backoff arithmetic.
    pub fn validate(&self) -> CoreResult<()> {
        if self.poll_interval_ms == 0 {
            return Err(CoreError::Config("poll_interval_ms must be positive".into()));
        }
        if self.poll_max_interval_ms < self.poll_interval_ms {
            return Err(CoreError::Config(
                "poll_max_interval_ms must be >= poll_interval_ms".into(),
            ));
        }
        if !self.poll_growth_factor.is_finite() || self.poll_growth_factor < 1.0 {
            return Err(CoreError::Config(
                "poll_growth_factor must be a finite number >= 1.0".into(),
            ));
        }
        if self.reconnect_max_delay_ms < self.reconnect_base_delay_ms {
            return Err(CoreError::Config(
                "reconnect_max_delay_ms must be >= reconnect_base_delay_ms".into(),
            ));
        }
        if self.init_attempts == 0 {
            return Err(CoreError::Config("init_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Supabase project URL.
    #[serde(default = "default_supabase_url")]
    pub supabase_url: String,
    /// Supabase anon API key (public, safe to expose).
    #[serde(default = "default_supabase_anon_key")]
    pub supabase_anon_key: String,
    /// Deployment URL of the web app.
    #[serde(default = "default_app_url")]
    pub app_url: String,
    /// Realtime delivery tunables.
    #[serde(default)]
    pub realtime: RealtimeSettings,
}

fn default_supabase_url() -> String {
    DEFAULT_SUPABASE_URL.to_string()
}

fn default_supabase_anon_key() -> String {
    DEFAULT_SUPABASE_ANON_KEY.to_string()
}

fn default_app_url() -> String {
    DEFAULT_APP_URL.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            supabase_url: DEFAULT_SUPABASE_URL.to_string(),
            supabase_anon_key: DEFAULT_SUPABASE_ANON_KEY.to_string(),
            app_url: DEFAULT_APP_URL.to_string(),
            realtime: RealtimeSettings::default(),
        }
    }
}

impl Config {
    /// Create a new Config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from the config file (if any), then apply env overrides.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.realtime.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    /// Override configuration from `NGOBRAS_*` environment variables.
    fn load_from_env(&mut self) {
        if let Some(level) = env_value("NGOBRAS_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(url) = env_value("NGOBRAS_SUPABASE_URL") {
            self.supabase_url = url;
        }
        if let Some(key) = env_value("NGOBRAS_SUPABASE_ANON_KEY") {
            self.supabase_anon_key = key;
        }
        if let Some(url) = env_value("NGOBRAS_APP_URL") {
            self.app_url = url;
        }
        if let Some(mode) = env_value("NGOBRAS_TRANSPORT_MODE") {
            match mode.parse() {
                Ok(mode) => self.realtime.transport_mode = mode,
                Err(err) => tracing::warn!(error = %err, "ignoring NGOBRAS_TRANSPORT_MODE"),
            }
        }
    }

    /// Get the Supabase URL as a parsed URL.
    pub fn supabase_url(&self) -> CoreResult<Url> {
        Url::parse(&self.supabase_url).map_err(CoreError::from)
    }

    /// Hostname of the deployed web app, if the app URL parses.
    pub fn app_hostname(&self) -> Option<String> {
        Url::parse(&self.app_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
    }

    /// True when both Supabase URL and anon key are present.
    pub fn has_supabase_credentials(&self) -> bool {
        !self.supabase_url.trim().is_empty() && !self.supabase_anon_key.trim().is_empty()
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
