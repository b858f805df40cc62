//! Opens the engine for one invocation and logs the user in.

use std::env;
use std::path::PathBuf;

use readlog_core::{load_config, ReadlogEngine, ReadlogError, StorageConfig, TrackerConfig, UserSession};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] ReadlogError),

    #[error("No user given; pass --user or set READLOG_USER")]
    MissingUser,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Usage(String),
}

/// Global flags shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub root: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub user: Option<String>,
    pub api_base: Option<String>,
}

impl Options {
    pub fn storage(&self) -> StorageConfig {
        match &self.root {
            Some(root) => StorageConfig::with_root(root.clone()),
            None => StorageConfig::default(),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| self.storage().config_file())
    }

    /// Config file contents with command-line overrides applied.
    pub fn config(&self) -> TrackerConfig {
        let mut config = load_config(&self.config_path());
        if let Some(base) = &self.api_base {
            config.api_base_url = base.clone();
        }
        config
    }
}

/// The flag wins over the environment; empty values count as absent.
pub fn resolve_user(flag: Option<String>, from_env: Option<String>) -> Option<String> {
    flag.or(from_env).filter(|user| !user.trim().is_empty())
}

pub fn open_engine(options: &Options) -> Result<ReadlogEngine, CliError> {
    let user = resolve_user(options.user.clone(), env::var("READLOG_USER").ok())
        .ok_or(CliError::MissingUser)?;
    let token = env::var("READLOG_TOKEN").ok().filter(|token| !token.is_empty());

    let engine = ReadlogEngine::open(&options.storage(), options.config())?;
    let migration = engine.login(UserSession::new(user, token));
    tracing::debug!(report = ?migration, "Session ready");
    Ok(engine)
}

pub fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_beats_environment() {
        assert_eq!(
            resolve_user(Some("alice".to_string()), Some("bob".to_string())),
            Some("alice".to_string())
        );
        assert_eq!(
            resolve_user(None, Some("bob".to_string())),
            Some("bob".to_string())
        );
    }

    #[test]
    fn test_blank_user_is_missing() {
        assert_eq!(resolve_user(Some("  ".to_string()), None), None);
        assert_eq!(resolve_user(None, None), None);
    }

    #[test]
    fn test_api_base_override() {
        let temp = tempfile::tempdir().unwrap();
        let options = Options {
            root: Some(temp.path().to_path_buf()),
            config: None,
            user: None,
            api_base: Some("https://example.test/api".to_string()),
        };
        assert_eq!(options.config().api_base_url, "https://example.test/api");
        assert_eq!(options.storage().root(), temp.path());
        assert_eq!(options.config_path(), temp.path().join("config.json"));
    }

    #[test]
    fn test_explicit_config_path() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("custom.json");
        std::fs::write(&path, r#"{"idle_threshold_secs": 120}"#).unwrap();
        let options = Options {
            config: Some(path.clone()),
            ..Options::default()
        };
        assert_eq!(options.config_path(), path);
        assert_eq!(options.config().idle_threshold_secs, 120);
    }
}
