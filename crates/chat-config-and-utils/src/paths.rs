//! Layout of the runtime directory.
//!
//! ```text
//! ~/.ngobras/
//!   config.json
//!   logs/sync.jsonl
//!   history/<conversation>.json
//! ```

use crate::{CoreError, CoreResult};
use std::path::{Path, PathBuf};

const BASE_DIR_NAME: &str = ".ngobras";

#[derive(Debug, Clone)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    /// Rooted at `~/.ngobras`.
    pub fn new() -> CoreResult<Self> {
        let home = dirs::home_dir().ok_or(CoreError::NoHomeDir)?;
        Ok(Self::with_base_dir(home.join(BASE_DIR_NAME)))
    }

    pub fn with_base_dir(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn base_dir(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn log_file(&self) -> PathBuf {
        self.logs_dir().join("sync.jsonl")
    }

    /// One JSON file per conversation, written by the file history store.
    pub fn history_dir(&self) -> PathBuf {
        self.root.join("history")
    }

    /// Create the root, log and history directories.
    pub fn ensure_dirs(&self) -> CoreResult<()> {
        for dir in [self.logs_dir(), self.history_dir()] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_layout_under_custom_root() {
        let root = PathBuf::from("/tmp/ngobras-layout");
        let paths = Paths::with_base_dir(root.clone());

        assert_eq!(paths.base_dir(), root.as_path());
        assert_eq!(paths.config_file(), root.join("config.json"));
        assert_eq!(paths.log_file(), root.join("logs").join("sync.jsonl"));
        assert_eq!(paths.history_dir(), root.join("history"));
    }

    #[test]
    fn test_default_root_is_in_home() {
        let Some(home) = dirs::home_dir() else {
            return;
        };
        assert_eq!(Paths::new().unwrap().base_dir(), home.join(".ngobras"));
    }

    #[test]
    fn test_ensure_dirs_is_repeatable() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().join("ngobras"));

        paths.ensure_dirs().unwrap();
        paths.ensure_dirs().unwrap();

        assert!(paths.base_dir().is_dir());
        assert!(paths.logs_dir().is_dir());
        assert!(paths.history_dir().is_dir());
    }
}
