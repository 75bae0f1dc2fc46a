//! Errors raised while loading configuration or touching `~/.ngobras`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    /// A setting failed validation or could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid Supabase URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("malformed config.json: {0}")]
    Json(#[from] serde_json::Error),

    /// No home directory and no `--base-dir` given.
    #[error("cannot locate home directory; pass --base-dir")]
    NoHomeDir,
}

pub type CoreResult<T> = Result<T, CoreError>;
