//! Cached per-domain permission.
//!
//! Gated domains are probed against the account's trust level; both outcomes
//! are cached for the capability TTL. A permanent denial returned by any call
//! is cached the same way, which silences the domain until the record expires.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::backoff::SyncDomain;
use crate::store::keys::capability_key;
use crate::store::DebouncedStorage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityRecord {
    pub allowed: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub checked_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_level: Option<u8>,
}

impl CapabilityRecord {
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.checked_at < ttl
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Allowed,
    Denied,
    /// No fresh record; a gated domain has to probe.
    Unknown,
}

pub fn load_capability(storage: &DebouncedStorage, domain: SyncDomain) -> Option<CapabilityRecord> {
    storage.get(&capability_key(domain.as_str()))
}

pub fn cached_capability(
    storage: &DebouncedStorage,
    domain: SyncDomain,
    now: DateTime<Utc>,
    ttl: Duration,
) -> Capability {
    match load_capability(storage, domain) {
        Some(record) if record.is_fresh(now, ttl) && record.allowed => Capability::Allowed,
        Some(record) if record.is_fresh(now, ttl) => Capability::Denied,
        _ if domain.is_gated() => Capability::Unknown,
        _ => Capability::Allowed,
    }
}

pub fn store_capability(storage: &DebouncedStorage, domain: SyncDomain, record: &CapabilityRecord) {
    if !record.allowed {
        info!(domain = %domain, trust_level = ?record.trust_level, "Sync domain not permitted; suppressing");
    }
    if let Err(err) = storage.set(&capability_key(domain.as_str()), record) {
        warn!(domain = %domain, error = %err, "Failed to cache capability");
    }
}
