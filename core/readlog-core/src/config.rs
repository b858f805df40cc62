//! Tracker configuration.
//!
//! A single immutable [`TrackerConfig`] value is built once (usually from
//! `~/.readlog/config.json`) and handed to every component's constructor.
//! Every field has a default so partial or older config files still load.

use chrono::Duration;
use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use crate::error::{ReadlogError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Base URL of the remote sync API.
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    /// Prefix applied to every persisted key.
    pub storage_namespace: String,

    // Debounced storage
    pub cache_ttl_ms: i64,
    pub debounce_ms: i64,

    // Accrual
    pub idle_threshold_secs: i64,
    pub accrual_interval_secs: i64,
    pub noise_floor_minutes: f64,
    pub session_log_cap: usize,
    pub retention_days: i64,

    // Aggregation
    pub aggregation_cache_capacity: usize,

    // Sync
    pub upload_window_days: i64,
    pub upload_max_entries: usize,
    pub resume_delay_secs: i64,
    pub backoff_base_secs: i64,
    pub backoff_max_secs: i64,
    pub max_failure_count: u32,
    pub capability_ttl_hours: i64,
    pub full_sync_interval_hours: i64,
    pub incremental_interval_hours: i64,
    pub reading_sync_interval_secs: i64,
    pub min_trust_level: u8,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:17700/api".to_string(),
            request_timeout_secs: 15,
            storage_namespace: "readlog".to_string(),
            cache_ttl_ms: 5_000,
            debounce_ms: 1_000,
            idle_threshold_secs: 60,
            accrual_interval_secs: 30,
            noise_floor_minutes: 0.1,
            session_log_cap: 20,
            retention_days: 365,
            aggregation_cache_capacity: 50,
            upload_window_days: 90,
            upload_max_entries: 100,
            resume_delay_secs: 35,
            backoff_base_secs: 60,
            backoff_max_secs: 30 * 60,
            max_failure_count: 6,
            capability_ttl_hours: 24,
            full_sync_interval_hours: 12,
            incremental_interval_hours: 1,
            reading_sync_interval_secs: 5 * 60,
            min_trust_level: 2,
        }
    }
}

impl TrackerConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::milliseconds(self.cache_ttl_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::milliseconds(self.debounce_ms)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::seconds(self.idle_threshold_secs)
    }

    pub fn accrual_interval(&self) -> Duration {
        Duration::seconds(self.accrual_interval_secs)
    }

    pub fn resume_delay(&self) -> Duration {
        Duration::seconds(self.resume_delay_secs)
    }

    pub fn capability_ttl(&self) -> Duration {
        Duration::hours(self.capability_ttl_hours)
    }

    pub fn full_sync_interval(&self) -> Duration {
        Duration::hours(self.full_sync_interval_hours)
    }

    pub fn incremental_interval(&self) -> Duration {
        Duration::hours(self.incremental_interval_hours)
    }

    pub fn reading_sync_interval(&self) -> Duration {
        Duration::seconds(self.reading_sync_interval_secs)
    }
}

/// Loads the config file, returning defaults if it is missing or unreadable.
pub fn load_config(path: &Path) -> TrackerConfig {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return TrackerConfig::default(),
        Err(err) => {
            warn!(error = %err, path = %path.display(), "Failed to read config; using defaults");
            return TrackerConfig::default();
        }
    };

    match serde_json::from_str(&content) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, path = %path.display(), "Malformed config; using defaults");
            TrackerConfig::default()
        }
    }
}

/// Saves the config as pretty JSON, creating the parent directory if needed.
pub fn save_config(path: &Path, config: &TrackerConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ReadlogError::Io {
            context: "creating config directory".to_string(),
            source,
        })?;
    }
    let content = serde_json::to_string_pretty(config).map_err(|source| ReadlogError::Json {
        context: "serializing config".to_string(),
        source,
    })?;
    fs::write(path, content).map_err(|source| ReadlogError::Io {
        context: format!("writing {}", path.display()),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let temp = tempdir().unwrap();
        let config = load_config(&temp.path().join("absent.json"));
        assert_eq!(config, TrackerConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"idle_threshold_secs": 120}"#).unwrap();

        let config = load_config(&path);
        assert_eq!(config.idle_threshold_secs, 120);
        assert_eq!(config.debounce_ms, 1_000);
        assert_eq!(config.upload_max_entries, 100);
    }

    #[test]
    fn test_corrupt_file_yields_defaults() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(load_config(&path), TrackerConfig::default());
    }

    #[test]
    fn test_save_then_load() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested").join("config.json");
        let config = TrackerConfig {
            api_base_url: "https://example.test/api".to_string(),
            ..TrackerConfig::default()
        };

        save_config(&path, &config).unwrap();
        assert_eq!(load_config(&path), config);
    }

    #[test]
    fn test_duration_helpers() {
        let config = TrackerConfig::default();
        assert_eq!(config.idle_threshold(), Duration::seconds(60));
        assert_eq!(config.debounce(), Duration::milliseconds(1_000));
        assert_eq!(config.capability_ttl(), Duration::hours(24));
    }
}
