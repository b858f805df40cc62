//! Per-domain sync bookkeeping and exponential backoff.
//!
//! Each domain keeps its own failure counter. After the n-th consecutive
//! failure the next attempt is admitted `base * 2^(n-1)` after the failure,
//! capped at `max`; the counter itself saturates at `max_failures`. Any
//! success resets it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::TrackerConfig;
use crate::error::Result;
use crate::store::keys::sync_state_key;
use crate::store::DebouncedStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDomain {
    Reading,
    Requirements,
}

impl SyncDomain {
    pub const ALL: [SyncDomain; 2] = [SyncDomain::Reading, SyncDomain::Requirements];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDomain::Reading => "reading",
            SyncDomain::Requirements => "requirements",
        }
    }

    /// Whether the domain needs a positive capability check before any call.
    pub fn is_gated(&self) -> bool {
        matches!(self, SyncDomain::Requirements)
    }
}

impl std::fmt::Display for SyncDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncState {
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub last_upload: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub last_download: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub last_full_sync: Option<DateTime<Utc>>,
    pub last_upload_hash: Option<String>,
    pub failure_count: u32,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub last_failure_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_failures: u32,
}

impl BackoffPolicy {
    pub fn from_config(config: &TrackerConfig) -> Self {
        Self {
            base: Duration::seconds(config.backoff_base_secs),
            max: Duration::seconds(config.backoff_max_secs),
            max_failures: config.max_failure_count,
        }
    }

    /// Wait imposed after `failure_count` consecutive failures.
    pub fn delay_for(&self, failure_count: u32) -> Duration {
        if failure_count == 0 {
            return Duration::zero();
        }
        let exponent = (failure_count - 1).min(30);
        let factor = 1i64 << exponent;
        let secs = self.base.num_seconds().saturating_mul(factor);
        std::cmp::min(Duration::seconds(secs), self.max)
    }
}

impl SyncState {
    pub fn record_failure(&mut self, now: DateTime<Utc>, policy: &BackoffPolicy) {
        self.failure_count = (self.failure_count + 1).min(policy.max_failures);
        self.last_failure_time = Some(now);
    }

    pub fn record_success(&mut self) {
        self.failure_count = 0;
        self.last_failure_time = None;
    }

    pub fn next_retry_at(&self, policy: &BackoffPolicy) -> Option<DateTime<Utc>> {
        if self.failure_count == 0 {
            return None;
        }
        let failed_at = self.last_failure_time?;
        Some(failed_at + policy.delay_for(self.failure_count))
    }

    pub fn can_retry(&self, now: DateTime<Utc>, policy: &BackoffPolicy) -> bool {
        self.next_retry_at(policy).map_or(true, |at| now >= at)
    }

    /// Time left before the next attempt is admitted; zero when admitted now.
    pub fn retry_in(&self, now: DateTime<Utc>, policy: &BackoffPolicy) -> Duration {
        match self.next_retry_at(policy) {
            Some(at) if at > now => at - now,
            _ => Duration::zero(),
        }
    }
}

pub fn load_state(storage: &DebouncedStorage, domain: SyncDomain) -> SyncState {
    storage
        .get(&sync_state_key(domain.as_str()))
        .unwrap_or_default()
}

pub fn save_state(storage: &DebouncedStorage, domain: SyncDomain, state: &SyncState) -> Result<()> {
    storage.set(&sync_state_key(domain.as_str()), state)
}

/// Loads, mutates and saves one domain's state. Save failures are logged; the
/// in-memory view in the storage cache still reflects the change.
pub fn update_state<F>(storage: &DebouncedStorage, domain: SyncDomain, apply: F) -> SyncState
where
    F: FnOnce(&mut SyncState),
{
    let mut state = load_state(storage, domain);
    apply(&mut state);
    if let Err(err) = save_state(storage, domain, &state) {
        warn!(domain = %domain, error = %err, "Failed to save sync state");
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::from_config(&TrackerConfig::default())
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn delay_doubles_and_caps() {
        let policy = policy();
        assert_eq!(policy.delay_for(0), Duration::zero());
        assert_eq!(policy.delay_for(1), Duration::seconds(60));
        assert_eq!(policy.delay_for(2), Duration::seconds(120));
        assert_eq!(policy.delay_for(3), Duration::seconds(240));
        assert_eq!(policy.delay_for(6), Duration::seconds(1800));
        assert_eq!(policy.delay_for(40), Duration::seconds(1800));
    }

    #[test]
    fn failure_count_saturates() {
        let policy = policy();
        let mut state = SyncState::default();
        for _ in 0..10 {
            state.record_failure(now(), &policy);
        }
        assert_eq!(state.failure_count, 6);
    }

    #[test]
    fn retry_admission_follows_deadline() {
        let policy = policy();
        let mut state = SyncState::default();
        assert!(state.can_retry(now(), &policy));

        state.record_failure(now(), &policy);
        state.record_failure(now(), &policy);
        assert!(!state.can_retry(now() + Duration::seconds(119), &policy));
        assert!(state.can_retry(now() + Duration::seconds(120), &policy));
        assert_eq!(
            state.retry_in(now() + Duration::seconds(20), &policy),
            Duration::seconds(100)
        );

        state.record_success();
        assert_eq!(state.failure_count, 0);
        assert!(state.can_retry(now(), &policy));
        assert_eq!(state.next_retry_at(&policy), None);
    }

    #[test]
    fn state_serializes_camel_case_millis() {
        let state = SyncState {
            last_download: Some(now()),
            failure_count: 2,
            ..SyncState::default()
        };
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["failureCount"], 2);
        assert_eq!(value["lastDownload"], now().timestamp_millis());
        assert!(value["lastUpload"].is_null());

        let parsed: SyncState = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(parsed, SyncState::default());
    }
}
