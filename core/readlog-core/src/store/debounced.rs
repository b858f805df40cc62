//! Read-through cache and write-behind buffer over a [`KeyValueStore`].
//!
//! `set` updates the in-memory view immediately and queues the write; the queue
//! is drained by [`DebouncedStorage::flush`], either explicitly or once the
//! debounce deadline reported by [`DebouncedStorage::flush_due`] has passed and
//! the owner calls [`DebouncedStorage::poll`]. Reads prefer, in order: the
//! pending buffer, a cache entry younger than the TTL, the backend.
//!
//! Flushing is best-effort. A key that fails to write is logged and skipped;
//! the remaining keys are still written.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::keys::KeyDeriver;
use super::kv::KeyValueStore;
use crate::clock::Clock;
use crate::config::TrackerConfig;
use crate::error::{ReadlogError, Result};

#[derive(Debug, Clone)]
struct CachedValue {
    value: Option<Value>,
    fetched_at: DateTime<Utc>,
}

struct Inner {
    keys: KeyDeriver,
    cache: HashMap<String, CachedValue>,
    pending: BTreeMap<String, Value>,
    flush_due: Option<DateTime<Utc>>,
}

/// Outcome of draining the write buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub written: usize,
    pub failed: Vec<String>,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct DebouncedStorage {
    backend: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    cache_ttl: Duration,
    debounce: Duration,
    inner: Mutex<Inner>,
    update_lock: Mutex<()>,
}

impl DebouncedStorage {
    pub fn new(
        backend: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        config: &TrackerConfig,
    ) -> Self {
        Self {
            backend,
            clock,
            cache_ttl: config.cache_ttl(),
            debounce: config.debounce(),
            inner: Mutex::new(Inner {
                keys: KeyDeriver::new(config.storage_namespace.clone()),
                cache: HashMap::new(),
                pending: BTreeMap::new(),
                flush_due: None,
            }),
            update_lock: Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn user_id(&self) -> Option<String> {
        self.lock().keys.user_id().map(str::to_string)
    }

    /// Switches the key namespace to another user.
    ///
    /// Pending writes were derived under the previous user and are flushed
    /// first; the value cache and key cache are then dropped.
    pub fn set_user(&self, user_id: Option<&str>) -> FlushReport {
        let drained = {
            let mut inner = self.lock();
            if inner.keys.user_id() == user_id {
                return FlushReport::default();
            }
            let drained = std::mem::take(&mut inner.pending);
            inner.flush_due = None;
            inner.keys.set_user(user_id);
            inner.cache.clear();
            drained
        };
        debug!(user_id = ?user_id, pending = drained.len(), "Storage user switched");
        self.write_all(drained)
    }

    pub fn get_value(&self, key: &str) -> Option<Value> {
        let now = self.clock.now();
        let derived = {
            let mut inner = self.lock();
            let derived = inner.keys.derive(key);
            if let Some(value) = inner.pending.get(&derived) {
                return Some(value.clone());
            }
            if let Some(cached) = inner.cache.get(&derived) {
                if now - cached.fetched_at < self.cache_ttl {
                    return cached.value.clone();
                }
            }
            derived
        };

        let value = match self.backend.get(&derived) {
            Ok(value) => value,
            Err(err) => {
                warn!(key = %derived, error = %err, "Storage read failed");
                return None;
            }
        };

        let mut inner = self.lock();
        // A set() may have raced in while the backend read was outstanding.
        if let Some(pending) = inner.pending.get(&derived) {
            return Some(pending.clone());
        }
        inner.cache.insert(
            derived,
            CachedValue {
                value: value.clone(),
                fetched_at: now,
            },
        );
        value
    }

    /// Typed read. Values that no longer match `T` are logged and treated as
    /// absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get_value(key)?;
        match serde_json::from_value(value) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                warn!(key = %key, error = %err, "Stored value has unexpected shape");
                None
            }
        }
    }

    /// Typed read that tells "absent" apart from "present but unreadable".
    /// Anything that is about to be rewritten must go through this, so a value
    /// written by a newer build is never replaced by a default.
    pub fn get_checked<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(value) = self.get_value(key) else {
            return Ok(None);
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|source| ReadlogError::Json {
                context: format!("reading {}", key),
                source,
            })
    }

    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = to_json(key, value)?;
        let now = self.clock.now();
        let mut inner = self.lock();
        let derived = inner.keys.derive(key);
        inner.cache.insert(
            derived.clone(),
            CachedValue {
                value: Some(value.clone()),
                fetched_at: now,
            },
        );
        inner.pending.insert(derived, value);
        if inner.flush_due.is_none() {
            inner.flush_due = Some(now + self.debounce);
        }
        Ok(())
    }

    /// Writes through immediately, bypassing the buffer. Used when the value
    /// must be durable before the process may go away.
    pub fn set_now<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = to_json(key, value)?;
        let now = self.clock.now();
        let derived = {
            let mut inner = self.lock();
            let derived = inner.keys.derive(key);
            inner.pending.remove(&derived);
            if inner.pending.is_empty() {
                inner.flush_due = None;
            }
            inner.cache.insert(
                derived.clone(),
                CachedValue {
                    value: Some(value.clone()),
                    fetched_at: now,
                },
            );
            derived
        };
        self.backend.set(&derived, value)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let now = self.clock.now();
        let derived = {
            let mut inner = self.lock();
            let derived = inner.keys.derive(key);
            inner.pending.remove(&derived);
            inner.cache.insert(
                derived.clone(),
                CachedValue {
                    value: None,
                    fetched_at: now,
                },
            );
            derived
        };
        self.backend.remove(&derived)
    }

    /// Read-modify-write of one key. Concurrent updaters of the same store are
    /// serialized so an accrual and a sync merge cannot drop each other's
    /// changes. `apply` returns whether it changed the value; unchanged values
    /// are not written. A stored value that does not parse as `T` is an error
    /// and is left as it is.
    pub fn update<T, F>(&self, key: &str, apply: F) -> Result<bool>
    where
        T: DeserializeOwned + Serialize + Default,
        F: FnOnce(&mut T) -> bool,
    {
        self.update_with(key, apply, false)
    }

    /// Like [`DebouncedStorage::update`], but writes through immediately.
    pub fn update_now<T, F>(&self, key: &str, apply: F) -> Result<bool>
    where
        T: DeserializeOwned + Serialize + Default,
        F: FnOnce(&mut T) -> bool,
    {
        self.update_with(key, apply, true)
    }

    fn update_with<T, F>(&self, key: &str, apply: F, immediate: bool) -> Result<bool>
    where
        T: DeserializeOwned + Serialize + Default,
        F: FnOnce(&mut T) -> bool,
    {
        let _guard = self.update_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut value: T = self.get_checked(key)?.unwrap_or_default();
        if !apply(&mut value) {
            return Ok(false);
        }
        if immediate {
            self.set_now(key, &value)?;
        } else {
            self.set(key, &value)?;
        }
        Ok(true)
    }

    /// Reads a key outside any user scope, straight from the backend.
    pub fn get_unscoped_value(&self, key: &str) -> Option<Value> {
        let derived = self.lock().keys.derive_unscoped(key);
        match self.backend.get(&derived) {
            Ok(value) => value,
            Err(err) => {
                warn!(key = %derived, error = %err, "Storage read failed");
                None
            }
        }
    }

    /// Drains the write buffer.
    pub fn flush(&self) -> FlushReport {
        let drained = {
            let mut inner = self.lock();
            inner.flush_due = None;
            std::mem::take(&mut inner.pending)
        };
        self.write_all(drained)
    }

    /// Flushes if the debounce deadline has passed. Returns `None` when there
    /// was nothing due.
    pub fn poll(&self) -> Option<FlushReport> {
        let due = self.flush_due()?;
        if self.clock.now() < due {
            return None;
        }
        Some(self.flush())
    }

    pub fn flush_due(&self) -> Option<DateTime<Utc>> {
        self.lock().flush_due
    }

    pub fn has_pending(&self) -> bool {
        !self.lock().pending.is_empty()
    }

    /// Drops the cached value for one key so the next read goes to the backend
    /// (pending writes still win).
    pub fn invalidate(&self, key: &str) {
        let mut inner = self.lock();
        let derived = inner.keys.derive(key);
        inner.cache.remove(&derived);
    }

    pub fn clear_cache(&self) {
        self.lock().cache.clear();
    }

    fn write_all(&self, entries: BTreeMap<String, Value>) -> FlushReport {
        let mut report = FlushReport::default();
        for (key, value) in entries {
            match self.backend.set(&key, value) {
                Ok(()) => report.written += 1,
                Err(err) => {
                    warn!(key = %key, error = %err, "Debounced write failed");
                    report.failed.push(key);
                }
            }
        }
        if report.written > 0 || !report.failed.is_empty() {
            debug!(
                written = report.written,
                failed = report.failed.len(),
                "Storage flushed"
            );
        }
        report
    }
}

fn to_json<T: Serialize>(key: &str, value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|source| ReadlogError::Json {
        context: format!("serializing {}", key),
        source,
    })
}
