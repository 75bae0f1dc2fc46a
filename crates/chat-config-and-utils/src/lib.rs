//! Configuration, paths, errors and logging setup shared by the NGOBRAS sync crates.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{
    Config, RealtimeSettings, TransportMode, DEFAULT_APP_URL, DEFAULT_LOG_LEVEL,
    DEFAULT_SUPABASE_ANON_KEY, DEFAULT_SUPABASE_URL,
};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, init_logging_for_service, parse_level};
pub use paths::Paths;
