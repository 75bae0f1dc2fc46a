//! Append-only JSONL file shared by every NGOBRAS process.

use crate::json_layer::JsonLayer;
use crate::LogConfig;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// `~/.ngobras/logs/sync.jsonl`, or under the temp dir without a home.
pub fn default_log_path() -> PathBuf {
    let mut path = dirs::home_dir().unwrap_or_else(std::env::temp_dir);
    path.extend([".ngobras", "logs", "sync.jsonl"]);
    path
}

/// Handle to the opened log file. Clones share one descriptor.
///
/// The file is opened with `O_APPEND` and each JSON line reaches it in a
/// single `write` call, so lines from concurrent processes do not interleave.
#[derive(Clone)]
pub struct CentralLogWriter {
    file: Arc<Mutex<File>>,
}

impl CentralLogWriter {
    pub fn new(path: &Path) -> io::Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }
}

impl Write for CentralLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.lock().write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.lock().flush()
    }
}

impl<'a> MakeWriter<'a> for CentralLogWriter {
    type Writer = CentralLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// `RUST_LOG` wins over the configured level.
pub(crate) fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

pub(crate) fn init_file_subscriber(config: &LogConfig) -> io::Result<()> {
    let log_path = config.log_path.clone().unwrap_or_else(default_log_path);
    let writer = CentralLogWriter::new(&log_path)?;

    let stderr = config.also_stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(io::stderr)
            .with_filter(env_filter(&config.default_level))
    });

    // Hosts and tests may have installed a subscriber already.
    let _ = tracing_subscriber::registry()
        .with(
            JsonLayer::new(config.service_name.as_str(), writer)
                .with_filter(env_filter(&config.default_level)),
        )
        .with(stderr)
        .try_init();

    tracing::debug!(log_path = %log_path.display(), "Logging to file");
    Ok(())
}
