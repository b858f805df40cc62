//! Storage configuration and path management for readlog.
//!
//! All on-disk locations are derived from one root so tests can point the
//! whole tree at a temp directory with [`StorageConfig::with_root`].

use std::path::{Path, PathBuf};

use crate::error::{ReadlogError, Result};

/// Central configuration for all readlog storage paths.
///
/// Production code uses `StorageConfig::default()` which points to `~/.readlog/`.
/// Tests use `StorageConfig::with_root(temp_dir)` for isolation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            root: home.join(".readlog"),
        }
    }
}

impl StorageConfig {
    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Files
    // ─────────────────────────────────────────────────────────────────────────────

    /// Path to store.json (every persisted key for every user).
    pub fn store_file(&self) -> PathBuf {
        self.root.join("store.json")
    }

    /// Path to config.json (tracker thresholds and API settings).
    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Directories
    // ─────────────────────────────────────────────────────────────────────────────

    /// Path to logs/ directory (daily rolling log files).
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.root.clone(), self.logs_dir()] {
            fs_err::create_dir_all(&dir).map_err(|source| ReadlogError::Io {
                context: format!("creating {}", dir.display()),
                source,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_paths_hang_off_root() {
        let config = StorageConfig::with_root(PathBuf::from("/tmp/readlog-test"));
        assert_eq!(
            config.store_file(),
            PathBuf::from("/tmp/readlog-test/store.json")
        );
        assert_eq!(
            config.config_file(),
            PathBuf::from("/tmp/readlog-test/config.json")
        );
        assert_eq!(config.logs_dir(), PathBuf::from("/tmp/readlog-test/logs"));
    }

    #[test]
    fn test_default_root_is_dot_readlog() {
        let config = StorageConfig::default();
        assert!(config.root().ends_with(".readlog"));
    }

    #[test]
    fn test_ensure_dirs_creates_tree() {
        let temp = tempdir().unwrap();
        let config = StorageConfig::with_root(temp.path().join("nested"));
        config.ensure_dirs().unwrap();
        assert!(config.logs_dir().is_dir());
    }
}
