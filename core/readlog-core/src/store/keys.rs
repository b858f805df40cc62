//! Storage key derivation.
//!
//! Every persisted key is `namespace.base_user`, so two users on the same
//! machine never read each other's ledgers. Derivation is a pure function of
//! (namespace, base key, user id); [`KeyDeriver`] only memoizes it and must be
//! reset whenever the active user changes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const READING_TIME_KEY: &str = "reading_time";
pub const HISTORY_KEY: &str = "history";
pub const MIGRATION_MARKER_KEY: &str = "migrated_v2";
/// Last day and minutes acknowledged by the today-sync endpoint. One key is
/// reused across days so nothing accumulates past retention.
pub const SYNCED_MARKER_KEY: &str = "reading_synced";

pub fn sync_state_key(domain: &str) -> String {
    format!("sync_state.{}", domain)
}

pub fn capability_key(domain: &str) -> String {
    format!("capability.{}", domain)
}

/// The identified user whose data the engine is operating on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSession {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl UserSession {
    pub fn new(user_id: impl Into<String>, token: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token,
        }
    }
}

pub fn scoped_key(namespace: &str, key: &str, user_id: Option<&str>) -> String {
    match user_id.filter(|id| !id.is_empty()) {
        Some(user_id) => format!("{}.{}_{}", namespace, key, user_id),
        None => format!("{}.{}", namespace, key),
    }
}

#[derive(Debug)]
pub struct KeyDeriver {
    namespace: String,
    user_id: Option<String>,
    cache: HashMap<String, String>,
}

impl KeyDeriver {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            user_id: None,
            cache: HashMap::new(),
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Switches the active user. Returns true when the user actually changed,
    /// in which case every memoized key has been dropped.
    pub fn set_user(&mut self, user_id: Option<&str>) -> bool {
        if self.user_id.as_deref() == user_id {
            return false;
        }
        self.user_id = user_id.map(str::to_string);
        self.cache.clear();
        true
    }

    pub fn derive(&mut self, key: &str) -> String {
        if let Some(derived) = self.cache.get(key) {
            return derived.clone();
        }
        let derived = scoped_key(&self.namespace, key, self.user_id.as_deref());
        self.cache.insert(key.to_string(), derived.clone());
        derived
    }

    /// Key outside any user scope (legacy data, machine-wide settings).
    pub fn derive_unscoped(&self, key: &str) -> String {
        scoped_key(&self.namespace, key, None)
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}
