//! Persistent key-value backends.
//!
//! The tracker treats persistence as an external collaborator with plain
//! get/set semantics. Two backends ship here:
//!
//! - [`MemoryStore`] for tests and ephemeral sessions
//! - [`JsonFileStore`], one JSON object on disk, rewritten atomically
//!   (temp file + rename) on every write
//!
//! Neither backend is transactional across keys; callers must not rely on two
//! `set` calls landing together.

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::warn;

use crate::error::{ReadlogError, Result};

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;
    fn set(&self, key: &str, value: Value) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory backend. Can be told to fail writes for specific keys, which is
/// how tests exercise best-effort flushing.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, Value>>,
    failing_keys: Mutex<HashSet<String>>,
    writes: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes_for(&self, key: &str) {
        self.failing_keys
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing_keys
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }

    /// Number of successful backend writes so far.
    pub fn write_count(&self) -> usize {
        *self.writes.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn keys(&self) -> Vec<String> {
        self.values
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let values = self.values.lock().unwrap_or_else(|p| p.into_inner());
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let failing = self
            .failing_keys
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(key);
        if failing {
            return Err(ReadlogError::StorageWrite {
                key: key.to_string(),
                details: "injected failure".to_string(),
            });
        }
        self.values
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.to_string(), value);
        *self.writes.lock().unwrap_or_else(|p| p.into_inner()) += 1;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key);
        Ok(())
    }
}

/// File-backed backend holding every key in one JSON object.
///
/// The whole object is kept in memory and rewritten on each mutation. Empty or
/// corrupt files load as an empty store rather than failing startup.
pub struct JsonFileStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, Value>>,
}

impl JsonFileStore {
    pub fn open(path: &Path) -> Result<Self> {
        let values = match std::fs::read_to_string(path) {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => match serde_json::from_str::<BTreeMap<String, Value>>(&content) {
                Ok(values) => values,
                Err(err) => {
                    warn!(
                        error = %err,
                        path = %path.display(),
                        "Store file is corrupt; starting empty"
                    );
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => {
                return Err(ReadlogError::Io {
                    context: format!("reading {}", path.display()),
                    source,
                })
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &BTreeMap<String, Value>) -> Result<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| ReadlogError::StoragePathInvalid(self.path.clone()))?;
        fs_err::create_dir_all(parent).map_err(|source| ReadlogError::Io {
            context: "creating store directory".to_string(),
            source,
        })?;

        let content = serde_json::to_vec(values).map_err(|source| ReadlogError::Json {
            context: "serializing store".to_string(),
            source,
        })?;

        let mut temp_file = NamedTempFile::new_in(parent).map_err(|source| ReadlogError::Io {
            context: "creating temp store file".to_string(),
            source,
        })?;
        temp_file
            .write_all(&content)
            .map_err(|source| ReadlogError::Io {
                context: "writing temp store file".to_string(),
                source,
            })?;
        temp_file.flush().map_err(|source| ReadlogError::Io {
            context: "flushing temp store file".to_string(),
            source,
        })?;
        temp_file
            .persist(&self.path)
            .map_err(|err| ReadlogError::Io {
                context: format!("replacing {}", self.path.display()),
                source: err.error,
            })?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let values = self.values.lock().unwrap_or_else(|p| p.into_inner());
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(|p| p.into_inner());
        let previous = values.insert(key.to_string(), value);
        if let Err(err) = self.persist(&values) {
            // Keep memory and disk in agreement when the write did not land.
            match previous {
                Some(previous) => values.insert(key.to_string(), previous),
                None => values.remove(key),
            };
            return Err(ReadlogError::StorageWrite {
                key: key.to_string(),
                details: err.to_string(),
            });
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(|p| p.into_inner());
        if values.remove(key).is_some() {
            self.persist(&values)?;
        }
        Ok(())
    }
}
