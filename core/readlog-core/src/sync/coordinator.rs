//! Reconciliation of local ledgers with the remote store.
//!
//! Two domains share the machinery here: `reading` (the minutes ledger) and
//! `requirements` (the counter history, gated on account trust level). Every
//! network call goes through the same admission path:
//!
//! 1. a cached permanent denial skips the call outright
//! 2. a domain still inside its backoff window skips the call
//! 3. the call runs with no lock held; its result is dropped if the session
//!    changed while it was in flight
//!
//! Only one operation runs at a time. Whoever finds the `syncing` flag set
//! gets `Skipped(InFlight)` back instead of waiting.
//!
//! Merges are max-wins per day for the ledger and latest-timestamp-wins per
//! day for history, so replaying an upload or download is harmless.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use readlog_protocol::{
    endpoints, ApiRequest, ApiResponse, HistoryPayload, ReadingLedgerPayload, TodaySyncRequest,
    TodaySyncResponse, TrustLevelResponse,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::backoff::{load_state, update_state, BackoffPolicy, SyncDomain, SyncState};
use super::capability::{
    cached_capability, load_capability, store_capability, Capability, CapabilityRecord,
};
use super::transfer::{ResumeReason, TransferState};
use crate::api::{new_request_id, ApiClient};
use crate::clock::Clock;
use crate::config::TrackerConfig;
use crate::dates::day_key;
use crate::error::{ReadlogError, Result};
use crate::history::{HistoryEntry, HistoryStore};
use crate::ledger::Ledger;
use crate::store::keys::{READING_TIME_KEY, SYNCED_MARKER_KEY};
use crate::store::{DebouncedStorage, UserSession};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SyncedMarker {
    day: String,
    minutes: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    NotLoggedIn,
    InFlight,
    BackedOff { retry_in_secs: i64 },
    CapabilityDenied,
    Unchanged,
    NothingToSend,
    NotDue { due_at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    Skipped(SkipReason),
    /// `changed` counts days merged on download or sent on upload.
    Completed { changed: usize },
    Truncated {
        server_minutes: f64,
        resume_at: DateTime<Utc>,
    },
    RateLimited { resume_at: DateTime<Utc> },
}

impl SyncOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, SyncOutcome::Skipped(_))
    }
}

/// Result of one step inside a composite operation whose errors are logged
/// rather than returned.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepResult {
    Done { outcome: SyncOutcome },
    Failed { error: String },
}

impl StepResult {
    fn record(step: &'static str, domain: SyncDomain, result: Result<SyncOutcome>) -> Self {
        match result {
            Ok(outcome) => {
                debug!(step, domain = %domain, outcome = ?outcome, "Sync step finished");
                StepResult::Done { outcome }
            }
            Err(err) => {
                warn!(step, domain = %domain, error = %err, "Sync step failed");
                StepResult::Failed {
                    error: err.to_string(),
                }
            }
        }
    }

    fn skipped(reason: SkipReason) -> Self {
        StepResult::Done {
            outcome: SyncOutcome::Skipped(reason),
        }
    }

    pub fn outcome(&self) -> Option<&SyncOutcome> {
        match self {
            StepResult::Done { outcome } => Some(outcome),
            StepResult::Failed { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StepResult::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageLoadReport {
    pub reading_download: StepResult,
    pub reading_upload: StepResult,
    pub requirements: StepResult,
}

impl PageLoadReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            reading_download: StepResult::skipped(reason.clone()),
            reading_upload: StepResult::skipped(reason.clone()),
            requirements: StepResult::skipped(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FullSyncReport {
    pub download: SyncOutcome,
    pub upload: SyncOutcome,
    pub batches: usize,
    pub requirements: StepResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct DomainStatus {
    pub domain: SyncDomain,
    pub state: SyncState,
    pub capability: Option<CapabilityRecord>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub user_id: Option<String>,
    pub syncing: bool,
    pub transfer: TransferState,
    pub next_reading_sync: Option<DateTime<Utc>>,
    pub domains: Vec<DomainStatus>,
}

#[derive(Debug, Clone)]
struct SessionContext {
    session: UserSession,
    generation: u64,
}

/// Clears the `syncing` flag when dropped.
struct SyncGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

fn quiet_denial(result: Result<SyncOutcome>) -> Result<SyncOutcome> {
    match result {
        Err(ReadlogError::CapabilityDenied { .. }) => {
            Ok(SyncOutcome::Skipped(SkipReason::CapabilityDenied))
        }
        other => other,
    }
}

fn to_body<T: Serialize>(endpoint: &str, payload: &T) -> Result<Value> {
    serde_json::to_value(payload).map_err(|source| ReadlogError::Json {
        context: format!("encoding body for {}", endpoint),
        source,
    })
}

fn payload_hash<T: Serialize>(payload: &T) -> Result<String> {
    let bytes = serde_json::to_vec(payload).map_err(|source| ReadlogError::Json {
        context: "hashing upload payload".to_string(),
        source,
    })?;
    Ok(format!("{:x}", md5::compute(bytes)))
}

pub struct SyncCoordinator {
    config: TrackerConfig,
    policy: BackoffPolicy,
    storage: Arc<DebouncedStorage>,
    history: Arc<HistoryStore>,
    api: Arc<dyn ApiClient>,
    clock: Arc<dyn Clock>,
    session: Mutex<Option<UserSession>>,
    generation: AtomicU64,
    syncing: AtomicBool,
    transfer: Mutex<TransferState>,
    next_reading_sync: Mutex<Option<DateTime<Utc>>>,
}

impl SyncCoordinator {
    pub fn new(
        config: &TrackerConfig,
        storage: Arc<DebouncedStorage>,
        history: Arc<HistoryStore>,
        api: Arc<dyn ApiClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config: config.clone(),
            policy: BackoffPolicy::from_config(config),
            storage,
            history,
            api,
            clock,
            session: Mutex::new(None),
            generation: AtomicU64::new(0),
            syncing: AtomicBool::new(false),
            transfer: Mutex::new(TransferState::Idle),
            next_reading_sync: Mutex::new(None),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Session and lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Replaces the active session. Results of calls started under the old
    /// session are discarded when they return.
    pub fn set_session(&self, session: Option<UserSession>) {
        *self.session.lock().unwrap_or_else(|p| p.into_inner()) = session;
        self.generation.fetch_add(1, Ordering::AcqRel);
        *self.transfer_lock() = TransferState::Idle;
        *self.timer_lock() = None;
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Cancels timers and pending resumes and detaches the session.
    pub fn destroy(&self) {
        self.set_session(None);
        debug!("Sync coordinator destroyed");
    }

    fn context(&self) -> Option<SessionContext> {
        let session = self
            .session
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()?;
        Some(SessionContext {
            session,
            generation: self.generation.load(Ordering::Acquire),
        })
    }

    fn ensure_current(&self, ctx: &SessionContext, operation: &str) -> Result<()> {
        if self.generation.load(Ordering::Acquire) == ctx.generation {
            return Ok(());
        }
        warn!(
            operation,
            user_id = %ctx.session.user_id,
            "Session changed during sync; discarding result"
        );
        Err(ReadlogError::SessionChanged {
            operation: operation.to_string(),
        })
    }

    fn begin(&self) -> Option<SyncGuard<'_>> {
        self.syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SyncGuard {
                flag: &self.syncing,
            })
    }

    fn transfer_lock(&self) -> MutexGuard<'_, TransferState> {
        self.transfer.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn timer_lock(&self) -> MutexGuard<'_, Option<DateTime<Utc>>> {
        self.next_reading_sync
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }

    pub fn transfer_state(&self) -> TransferState {
        self.transfer_lock().clone()
    }

    /// Earliest instant at which [`SyncCoordinator::tick`] has work to do.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        let timer = *self.timer_lock();
        let resume = self.transfer_lock().deadline();
        match (timer, resume) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Admission and calls
    // ─────────────────────────────────────────────────────────────────────

    fn record_failure(&self, domain: SyncDomain) {
        let now = self.clock.now();
        let policy = self.policy;
        let state = update_state(&self.storage, domain, |state| {
            state.record_failure(now, &policy)
        });
        warn!(
            domain = %domain,
            failures = state.failure_count,
            retry_at = ?state.next_retry_at(&policy),
            "Sync failed; backing off"
        );
    }

    fn record_success<F>(&self, domain: SyncDomain, apply: F)
    where
        F: FnOnce(&mut SyncState),
    {
        update_state(&self.storage, domain, |state| {
            apply(state);
            state.record_success();
        });
        if domain == SyncDomain::Reading {
            let mut transfer = self.transfer_lock();
            if matches!(*transfer, TransferState::Backoff { .. }) {
                *transfer = TransferState::Idle;
            }
        }
    }

    fn backoff_skip(&self, domain: SyncDomain) -> Option<SkipReason> {
        let now = self.clock.now();
        let state = load_state(&self.storage, domain);
        if state.can_retry(now, &self.policy) {
            return None;
        }
        Some(SkipReason::BackedOff {
            retry_in_secs: state.retry_in(now, &self.policy).num_seconds(),
        })
    }

    /// Capability and backoff admission. Gated domains without a fresh record
    /// probe the trust level first.
    fn admit(&self, ctx: &SessionContext, domain: SyncDomain) -> Result<Option<SkipReason>> {
        let now = self.clock.now();
        match cached_capability(&self.storage, domain, now, self.config.capability_ttl()) {
            Capability::Allowed => {}
            Capability::Denied => return Ok(Some(SkipReason::CapabilityDenied)),
            Capability::Unknown => {
                if let Some(skip) = self.backoff_skip(domain) {
                    return Ok(Some(skip));
                }
                if !self.probe_capability(ctx, domain)? {
                    return Ok(Some(SkipReason::CapabilityDenied));
                }
            }
        }
        Ok(self.backoff_skip(domain))
    }

    fn probe_capability(&self, ctx: &SessionContext, domain: SyncDomain) -> Result<bool> {
        let response = self.call(ctx, domain, endpoints::TRUST_LEVEL, ApiRequest::get())?;
        let trust: TrustLevelResponse = self.decode(domain, endpoints::TRUST_LEVEL, &response)?;
        let allowed = trust.trust_level >= self.config.min_trust_level;
        store_capability(
            &self.storage,
            domain,
            &CapabilityRecord {
                allowed,
                checked_at: self.clock.now(),
                trust_level: Some(trust.trust_level),
            },
        );
        Ok(allowed)
    }

    fn call(
        &self,
        ctx: &SessionContext,
        domain: SyncDomain,
        endpoint: &str,
        request: ApiRequest,
    ) -> Result<ApiResponse> {
        let request = request
            .with_token(ctx.session.token.clone())
            .with_request_id(new_request_id());
        debug!(
            domain = %domain,
            endpoint,
            method = ?request.method,
            request_id = ?request.request_id,
            "Sync call"
        );

        let result = self.api.call(endpoint, request);
        self.ensure_current(ctx, endpoint)?;

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                self.record_failure(domain);
                return Err(err);
            }
        };
        if let Some(info) = response.error_info() {
            if info.is_permanent_denial() {
                store_capability(
                    &self.storage,
                    domain,
                    &CapabilityRecord {
                        allowed: false,
                        checked_at: self.clock.now(),
                        trust_level: None,
                    },
                );
                return Err(ReadlogError::CapabilityDenied {
                    domain: domain.to_string(),
                });
            }
            self.record_failure(domain);
            return Err(ReadlogError::api(endpoint, info));
        }
        Ok(response)
    }

    fn decode<T: DeserializeOwned>(
        &self,
        domain: SyncDomain,
        endpoint: &str,
        response: &ApiResponse,
    ) -> Result<T> {
        response.decode_data().map_err(|info| {
            self.record_failure(domain);
            ReadlogError::InvalidPayload {
                endpoint: endpoint.to_string(),
                details: info.message,
            }
        })
    }

    fn invalid(&self, domain: SyncDomain, endpoint: &str, details: String) -> ReadlogError {
        self.record_failure(domain);
        ReadlogError::InvalidPayload {
            endpoint: endpoint.to_string(),
            details,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reading domain
    // ─────────────────────────────────────────────────────────────────────

    fn local_ledger(&self) -> Ledger {
        self.storage.get(READING_TIME_KEY).unwrap_or_default()
    }

    fn download_reading(&self, ctx: &SessionContext) -> Result<SyncOutcome> {
        let domain = SyncDomain::Reading;
        if let Some(skip) = self.admit(ctx, domain)? {
            return Ok(SyncOutcome::Skipped(skip));
        }

        let response = self.call(ctx, domain, endpoints::READING_TIME, ApiRequest::get())?;
        let payload: ReadingLedgerPayload =
            self.decode(domain, endpoints::READING_TIME, &response)?;
        if let Err(info) = payload.validate() {
            return Err(self.invalid(domain, endpoints::READING_TIME, info.message));
        }

        let mut changed = 0;
        self.storage
            .update(READING_TIME_KEY, |ledger: &mut Ledger| {
                if ledger.is_empty() {
                    *ledger = Ledger::from_remote(&payload);
                    changed = ledger.daily_data.len();
                } else {
                    changed = ledger.merge_max(&payload.daily_data);
                }
                changed > 0
            })?;

        let now = self.clock.now();
        self.record_success(domain, |state| state.last_download = Some(now));
        info!(changed, remote_days = payload.daily_data.len(), "Reading ledger downloaded");
        Ok(SyncOutcome::Completed { changed })
    }

    fn upload_reading(&self, ctx: &SessionContext) -> Result<SyncOutcome> {
        let domain = SyncDomain::Reading;
        let payload = self.local_ledger().recent_payload(
            self.clock.today(),
            self.config.upload_window_days,
            self.config.upload_max_entries,
        );
        if payload.daily_data.is_empty() {
            return Ok(SyncOutcome::Skipped(SkipReason::NothingToSend));
        }
        let hash = payload_hash(&payload)?;
        if load_state(&self.storage, domain).last_upload_hash.as_deref() == Some(hash.as_str()) {
            return Ok(SyncOutcome::Skipped(SkipReason::Unchanged));
        }
        if let Some(skip) = self.admit(ctx, domain)? {
            return Ok(SyncOutcome::Skipped(skip));
        }

        let body = to_body(endpoints::READING_TIME, &payload)?;
        self.call(ctx, domain, endpoints::READING_TIME, ApiRequest::post(body))?;

        let now = self.clock.now();
        let days = payload.daily_data.len();
        self.record_success(domain, |state| {
            state.last_upload = Some(now);
            state.last_upload_hash = Some(hash);
        });
        info!(days, "Reading ledger uploaded");
        Ok(SyncOutcome::Completed { changed: days })
    }

    /// Uploads the whole ledger in bounded batches.
    fn upload_reading_all(&self, ctx: &SessionContext) -> Result<(SyncOutcome, usize)> {
        let domain = SyncDomain::Reading;
        let ledger = self.local_ledger();
        let chunks = ledger.payload_chunks(self.config.upload_max_entries);
        if chunks.is_empty() {
            return Ok((SyncOutcome::Skipped(SkipReason::NothingToSend), 0));
        }
        if let Some(skip) = self.admit(ctx, domain)? {
            return Ok((SyncOutcome::Skipped(skip), 0));
        }

        let mut days = 0;
        for chunk in &chunks {
            let body = to_body(endpoints::READING_TIME, chunk)?;
            self.call(ctx, domain, endpoints::READING_TIME, ApiRequest::post(body))?;
            days += chunk.daily_data.len();
        }

        // The recent window was covered too, so the next incremental upload
        // can be skipped until something accrues.
        let recent_hash = payload_hash(&ledger.recent_payload(
            self.clock.today(),
            self.config.upload_window_days,
            self.config.upload_max_entries,
        ))?;
        let now = self.clock.now();
        self.record_success(domain, |state| {
            state.last_upload = Some(now);
            state.last_full_sync = Some(now);
            state.last_upload_hash = Some(recent_hash);
        });
        info!(days, batches = chunks.len(), "Full reading ledger uploaded");
        Ok((SyncOutcome::Completed { changed: days }, chunks.len()))
    }

    fn transfer_skip(&self, now: DateTime<Utc>) -> Option<SkipReason> {
        let mut transfer = self.transfer_lock();
        // The stored failure state is authoritative; it may have been cleared
        // by a later success here or by another writer to the same store.
        if matches!(*transfer, TransferState::Backoff { .. })
            && load_state(&self.storage, SyncDomain::Reading).can_retry(now, &self.policy)
        {
            *transfer = TransferState::Idle;
        }
        if transfer.can_begin(now) {
            return None;
        }
        match &*transfer {
            TransferState::PendingResume { resume_at, .. } => Some(SkipReason::NotDue {
                due_at: *resume_at,
            }),
            TransferState::Backoff { until } => Some(SkipReason::BackedOff {
                retry_in_secs: (*until - now).num_seconds(),
            }),
            TransferState::InFlight => Some(SkipReason::InFlight),
            TransferState::Idle => None,
        }
    }

    fn set_transfer(&self, state: TransferState) {
        *self.transfer_lock() = state;
    }

    fn sync_today(&self, ctx: &SessionContext) -> Result<SyncOutcome> {
        let domain = SyncDomain::Reading;
        if let Some(skip) = self.transfer_skip(self.clock.now()) {
            return Ok(SyncOutcome::Skipped(skip));
        }

        let day = day_key(self.clock.today());
        let minutes = self.local_ledger().minutes_on(&day);
        if minutes <= 0.0 {
            return Ok(SyncOutcome::Skipped(SkipReason::NothingToSend));
        }
        if let Some(synced) = self.storage.get::<SyncedMarker>(SYNCED_MARKER_KEY) {
            if synced.day == day && (synced.minutes - minutes).abs() < 1e-9 {
                return Ok(SyncOutcome::Skipped(SkipReason::Unchanged));
            }
        }
        if let Some(skip) = self.admit(ctx, domain)? {
            return Ok(SyncOutcome::Skipped(skip));
        }

        let request = TodaySyncRequest {
            date: day.clone(),
            minutes,
        };
        if let Err(info) = request.validate() {
            return Err(self.invalid(domain, endpoints::READING_TIME_TODAY, info.message));
        }
        let body = to_body(endpoints::READING_TIME_TODAY, &request)?;
        self.set_transfer(TransferState::InFlight);
        let result = self
            .call(ctx, domain, endpoints::READING_TIME_TODAY, ApiRequest::post(body))
            .and_then(|response| {
                self.decode::<TodaySyncResponse>(domain, endpoints::READING_TIME_TODAY, &response)
            });
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                let next = match load_state(&self.storage, domain).next_retry_at(&self.policy) {
                    Some(until) if !matches!(err, ReadlogError::SessionChanged { .. }) => {
                        TransferState::Backoff { until }
                    }
                    _ => TransferState::Idle,
                };
                self.set_transfer(next);
                return Err(err);
            }
        };

        let now = self.clock.now();
        let resume_at = now + self.config.resume_delay();
        if response.truncated {
            self.set_marker(&day, response.server_minutes);
            self.record_success(domain, |_| {});
            self.set_transfer(TransferState::PendingResume {
                resume_at,
                reason: ResumeReason::Truncated,
            });
            info!(
                day = %day,
                client_minutes = minutes,
                server_minutes = response.server_minutes,
                "Server truncated today's minutes; resume scheduled"
            );
            return Ok(SyncOutcome::Truncated {
                server_minutes: response.server_minutes,
                resume_at,
            });
        }
        if response.rate_limited {
            self.set_transfer(TransferState::PendingResume {
                resume_at,
                reason: ResumeReason::RateLimited,
            });
            info!(day = %day, "Today sync rate limited; resume scheduled");
            return Ok(SyncOutcome::RateLimited { resume_at });
        }

        self.set_marker(&day, minutes);
        self.record_success(domain, |_| {});
        self.set_transfer(TransferState::Idle);
        debug!(day = %day, minutes, "Today's minutes synced");
        Ok(SyncOutcome::Completed { changed: 1 })
    }

    fn set_marker(&self, day: &str, minutes: f64) {
        let marker = SyncedMarker {
            day: day.to_string(),
            minutes,
        };
        if let Err(err) = self.storage.set(SYNCED_MARKER_KEY, &marker) {
            warn!(day, error = %err, "Failed to store sync marker");
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Requirements domain
    // ─────────────────────────────────────────────────────────────────────

    fn download_history(&self, ctx: &SessionContext, full: bool) -> Result<SyncOutcome> {
        let domain = SyncDomain::Requirements;
        if let Some(skip) = self.admit(ctx, domain)? {
            return Ok(SyncOutcome::Skipped(skip));
        }

        let since = match (full, load_state(&self.storage, domain).last_download) {
            (false, Some(at)) => at.timestamp_millis(),
            _ => 0,
        };
        let endpoint = format!("{}?since={}", endpoints::REQUIREMENTS_HISTORY, since);
        let response = self.call(ctx, domain, &endpoint, ApiRequest::get())?;
        let payload: HistoryPayload = self.decode(domain, &endpoint, &response)?;
        if let Err(info) = payload.validate() {
            return Err(self.invalid(domain, &endpoint, info.message));
        }

        let changed = self.history.merge_remote(&payload.entries)?;
        let now = self.clock.now();
        self.record_success(domain, |state| state.last_download = Some(now));
        debug!(changed, full, "Requirement history downloaded");
        Ok(SyncOutcome::Completed { changed })
    }

    fn upload_history(&self, ctx: &SessionContext, full: bool) -> Result<SyncOutcome> {
        let domain = SyncDomain::Requirements;
        let state = load_state(&self.storage, domain);
        let entries = match (full, state.last_upload) {
            (false, Some(since)) => self.history.entries_since(since),
            _ => self.history.entries(),
        };
        if entries.is_empty() {
            return Ok(SyncOutcome::Skipped(SkipReason::NothingToSend));
        }
        let payload = HistoryPayload {
            entries: entries.iter().map(HistoryEntry::to_record).collect(),
        };
        let hash = payload_hash(&payload)?;
        if !full && state.last_upload_hash.as_deref() == Some(hash.as_str()) {
            return Ok(SyncOutcome::Skipped(SkipReason::Unchanged));
        }
        if let Some(skip) = self.admit(ctx, domain)? {
            return Ok(SyncOutcome::Skipped(skip));
        }

        let body = to_body(endpoints::REQUIREMENTS_HISTORY, &payload)?;
        self.call(ctx, domain, endpoints::REQUIREMENTS_HISTORY, ApiRequest::post(body))?;

        let now = self.clock.now();
        let sent = payload.entries.len();
        self.record_success(domain, |state| {
            state.last_upload = Some(now);
            state.last_upload_hash = Some(hash);
        });
        debug!(sent, full, "Requirement history uploaded");
        Ok(SyncOutcome::Completed { changed: sent })
    }

    fn sync_history(&self, ctx: &SessionContext, full: bool) -> Result<SyncOutcome> {
        let download = self.download_history(ctx, full)?;
        let downloaded = match download {
            SyncOutcome::Completed { changed } => changed,
            skipped => return Ok(skipped),
        };
        let uploaded = match self.upload_history(ctx, full)? {
            SyncOutcome::Completed { changed } => changed,
            _ => 0,
        };
        if full {
            let now = self.clock.now();
            update_state(&self.storage, SyncDomain::Requirements, |state| {
                state.last_full_sync = Some(now)
            });
        }
        Ok(SyncOutcome::Completed {
            changed: downloaded + uploaded,
        })
    }

    /// Full sync when history was never downloaded or the last full sync is
    /// stale; otherwise an incremental one once the download interval passed.
    fn page_load_history(&self, ctx: &SessionContext) -> Result<SyncOutcome> {
        let now = self.clock.now();
        let state = load_state(&self.storage, SyncDomain::Requirements);
        let full_due = state.last_download.is_none()
            || state
                .last_full_sync
                .map_or(true, |at| now - at >= self.config.full_sync_interval());
        if full_due {
            return self.sync_history(ctx, true);
        }
        match state.last_download {
            Some(at) if now - at < self.config.incremental_interval() => {
                Ok(SyncOutcome::Skipped(SkipReason::NotDue {
                    due_at: at + self.config.incremental_interval(),
                }))
            }
            _ => self.sync_history(ctx, false),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Public operations
    // ─────────────────────────────────────────────────────────────────────

    fn guarded<F>(&self, operation: F) -> Result<SyncOutcome>
    where
        F: FnOnce(&SessionContext) -> Result<SyncOutcome>,
    {
        let Some(ctx) = self.context() else {
            return Ok(SyncOutcome::Skipped(SkipReason::NotLoggedIn));
        };
        let Some(_guard) = self.begin() else {
            return Ok(SyncOutcome::Skipped(SkipReason::InFlight));
        };
        quiet_denial(operation(&ctx))
    }

    /// Pulls the remote ledger and merges it into the local one.
    pub fn download(&self) -> Result<SyncOutcome> {
        self.guarded(|ctx| self.download_reading(ctx))
    }

    /// Pushes the recent window of the local ledger.
    pub fn upload(&self) -> Result<SyncOutcome> {
        self.guarded(|ctx| self.upload_reading(ctx))
    }

    /// Pushes today's minutes, honoring truncation and rate limits.
    pub fn sync_reading_time(&self) -> Result<SyncOutcome> {
        self.guarded(|ctx| self.sync_today(ctx))
    }

    pub fn download_requirements(&self) -> Result<SyncOutcome> {
        self.guarded(|ctx| self.download_history(ctx, false))
    }

    pub fn upload_requirements(&self) -> Result<SyncOutcome> {
        self.guarded(|ctx| self.upload_history(ctx, false))
    }

    /// Download, then whole-ledger upload, then the requirements domain, all
    /// under one hold of the syncing flag.
    pub fn full_sync(&self) -> Result<FullSyncReport> {
        let Some(ctx) = self.context() else {
            return Err(ReadlogError::NotLoggedIn);
        };
        let Some(_guard) = self.begin() else {
            let skipped = SyncOutcome::Skipped(SkipReason::InFlight);
            return Ok(FullSyncReport {
                download: skipped.clone(),
                upload: skipped,
                batches: 0,
                requirements: StepResult::skipped(SkipReason::InFlight),
            });
        };

        let download = quiet_denial(self.download_reading(&ctx))?;
        let (upload, batches) = match self.upload_reading_all(&ctx) {
            Err(ReadlogError::CapabilityDenied { .. }) => {
                (SyncOutcome::Skipped(SkipReason::CapabilityDenied), 0)
            }
            other => other?,
        };
        let requirements = StepResult::record(
            "full_sync",
            SyncDomain::Requirements,
            quiet_denial(self.sync_history(&ctx, true)),
        );
        info!(
            download = ?download,
            upload = ?upload,
            batches,
            "Full sync finished"
        );
        Ok(FullSyncReport {
            download,
            upload,
            batches,
            requirements,
        })
    }

    /// Page-load sequence: reading download before upload, then the
    /// requirements domain if due. Arms the periodic reading-time sync.
    pub fn on_page_load(&self) -> PageLoadReport {
        let Some(ctx) = self.context() else {
            return PageLoadReport::skipped(SkipReason::NotLoggedIn);
        };
        let report = {
            let Some(_guard) = self.begin() else {
                return PageLoadReport::skipped(SkipReason::InFlight);
            };
            PageLoadReport {
                reading_download: StepResult::record(
                    "download",
                    SyncDomain::Reading,
                    quiet_denial(self.download_reading(&ctx)),
                ),
                reading_upload: StepResult::record(
                    "upload",
                    SyncDomain::Reading,
                    quiet_denial(self.upload_reading(&ctx)),
                ),
                requirements: StepResult::record(
                    "page_load",
                    SyncDomain::Requirements,
                    quiet_denial(self.page_load_history(&ctx)),
                ),
            }
        };
        if self.ensure_current(&ctx, "page_load").is_ok() {
            *self.timer_lock() = Some(self.clock.now() + self.config.reading_sync_interval());
        }
        report
    }

    /// Runs the periodic reading-time sync and any due resume. Never fails;
    /// errors are logged and reported.
    pub fn tick(&self) -> Option<StepResult> {
        let now = self.clock.now();
        let timer_due = {
            let mut next = self.timer_lock();
            match *next {
                Some(at) if at <= now => {
                    *next = Some(now + self.config.reading_sync_interval());
                    true
                }
                _ => false,
            }
        };
        let resume_due = self.transfer_lock().is_due(now);
        if !timer_due && !resume_due {
            return None;
        }
        Some(StepResult::record(
            "sync_reading_time",
            SyncDomain::Reading,
            self.sync_reading_time(),
        ))
    }

    pub fn sync_status(&self) -> SyncStatus {
        let user_id = self
            .session
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|session| session.user_id.clone());
        let domains = SyncDomain::ALL
            .iter()
            .map(|domain| {
                let state = load_state(&self.storage, *domain);
                DomainStatus {
                    domain: *domain,
                    next_retry_at: state.next_retry_at(&self.policy),
                    capability: load_capability(&self.storage, *domain),
                    state,
                }
            })
            .collect();
        SyncStatus {
            user_id,
            syncing: self.is_syncing(),
            transfer: self.transfer_state(),
            next_reading_sync: *self.timer_lock(),
            domains,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregationEngine;
    use crate::api::ScriptedApiClient;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use chrono::{Duration, NaiveDate, TimeZone};
    use readlog_protocol::{codes, Method};
    use serde_json::json;

    struct Fixture {
        clock: Arc<ManualClock>,
        backend: Arc<MemoryStore>,
        storage: Arc<DebouncedStorage>,
        api: Arc<ScriptedApiClient>,
        sync: SyncCoordinator,
    }

    fn fixture() -> Fixture {
        let config = TrackerConfig::default();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 20, 12, 0, 0).unwrap(),
        ));
        let backend = Arc::new(MemoryStore::new());
        let storage = Arc::new(DebouncedStorage::new(
            backend.clone(),
            clock.clone(),
            &config,
        ));
        storage.set_user(Some("u1"));
        let aggregation = Arc::new(AggregationEngine::new(clock.clone(), 50));
        let history = Arc::new(HistoryStore::new(
            storage.clone(),
            aggregation,
            clock.clone(),
            &config,
        ));
        let api = Arc::new(ScriptedApiClient::new());
        let sync = SyncCoordinator::new(&config, storage.clone(), history, api.clone(), clock.clone());
        sync.set_session(Some(UserSession::new("u1", Some("tok".to_string()))));
        Fixture {
            clock,
            backend,
            storage,
            api,
            sync,
        }
    }

    fn seed_today(fx: &Fixture, minutes: f64) {
        let mut ledger = Ledger::new();
        ledger.add_minutes(
            NaiveDate::from_ymd_opt(2024, 1, 20).unwrap(),
            minutes,
            fx.clock.now(),
            20,
        );
        fx.storage.set(READING_TIME_KEY, &ledger).unwrap();
    }

    fn ledger(fx: &Fixture) -> Ledger {
        fx.storage.get(READING_TIME_KEY).unwrap()
    }

    fn synced_minutes(fx: &Fixture, day: &str) -> Option<f64> {
        fx.storage
            .get::<SyncedMarker>(SYNCED_MARKER_KEY)
            .filter(|marker| marker.day == day)
            .map(|marker| marker.minutes)
    }

    #[test]
    fn test_download_adopts_remote_when_local_empty() {
        let fx = fixture();
        fx.api.push_ok(
            endpoints::READING_TIME,
            json!({"dailyData": {"2024-01-01": {"totalMinutes": 30.0}}}),
        );

        let outcome = fx.sync.download().unwrap();

        assert_eq!(outcome, SyncOutcome::Completed { changed: 1 });
        let ledger = ledger(&fx);
        assert_eq!(ledger.minutes_on("2024-01-01"), 30.0);
        assert_eq!(ledger.month_minutes("2024-01"), 30.0);
    }

    #[test]
    fn test_download_leaves_unreadable_local_ledger_alone() {
        let fx = fixture();
        let stored = json!({"version": 3, "dailyData": {"2024-01-01": 500}});
        fx.storage.set(READING_TIME_KEY, &stored).unwrap();
        fx.api.push_ok(
            endpoints::READING_TIME,
            json!({"dailyData": {"2024-01-01": {"totalMinutes": 30.0}}}),
        );

        assert!(matches!(
            fx.sync.download(),
            Err(ReadlogError::Json { .. })
        ));
        assert_eq!(fx.storage.get_value(READING_TIME_KEY), Some(stored));
    }

    #[test]
    fn test_download_merges_max_wins() {
        let fx = fixture();
        let mut local = Ledger::new();
        let at = fx.clock.now();
        local.add_minutes(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), 45.0, at, 20);
        local.add_minutes(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(), 60.0, at, 20);
        fx.storage.set(READING_TIME_KEY, &local).unwrap();
        fx.api.push_ok(
            endpoints::READING_TIME,
            json!({"dailyData": {
                "2024-01-01": {"totalMinutes": 50.0},
                "2024-01-02": {"totalMinutes": 50.0}
            }}),
        );

        fx.sync.download().unwrap();

        let ledger = ledger(&fx);
        assert_eq!(ledger.minutes_on("2024-01-01"), 50.0);
        assert_eq!(ledger.minutes_on("2024-01-02"), 60.0);
        assert_eq!(ledger.month_minutes("2024-01"), 110.0);
    }

    #[test]
    fn test_upload_skips_unchanged_payload() {
        let fx = fixture();
        seed_today(&fx, 12.0);
        fx.api
            .respond_always(endpoints::READING_TIME, ApiResponse::ok(json!({})));

        assert_eq!(fx.sync.upload().unwrap(), SyncOutcome::Completed { changed: 1 });
        assert_eq!(
            fx.sync.upload().unwrap(),
            SyncOutcome::Skipped(SkipReason::Unchanged)
        );
        assert_eq!(fx.api.calls_to(endpoints::READING_TIME, Method::Post).len(), 1);
        assert_eq!(fx.api.calls()[0].token.as_deref(), Some("tok"));
    }

    #[test]
    fn test_failures_back_off_exponentially() {
        let fx = fixture();
        seed_today(&fx, 12.0);
        fx.api.respond_always(
            endpoints::READING_TIME,
            ApiResponse::failure(codes::HTTP_ERROR, "boom"),
        );

        assert!(fx.sync.upload().is_err());
        let state = load_state(&fx.storage, SyncDomain::Reading);
        assert_eq!(state.failure_count, 1);
        assert_eq!(
            fx.sync.upload().unwrap(),
            SyncOutcome::Skipped(SkipReason::BackedOff { retry_in_secs: 60 })
        );

        fx.clock.advance(Duration::seconds(60));
        assert!(fx.sync.upload().is_err());
        fx.clock.advance(Duration::seconds(119));
        assert!(fx.sync.upload().unwrap().is_skipped());
        fx.clock.advance(Duration::seconds(1));
        assert!(fx.sync.upload().is_err());

        let state = load_state(&fx.storage, SyncDomain::Reading);
        assert_eq!(state.failure_count, 3);
        assert_eq!(
            state.next_retry_at(&fx.sync.policy),
            Some(fx.clock.now() + Duration::seconds(240))
        );
        assert_eq!(fx.api.call_count(), 3);
    }

    #[test]
    fn test_success_resets_backoff() {
        let fx = fixture();
        seed_today(&fx, 12.0);
        fx.api.push(
            endpoints::READING_TIME,
            ApiResponse::failure(codes::HTTP_ERROR, "boom"),
        );
        fx.api.push_ok(endpoints::READING_TIME, json!({}));

        assert!(fx.sync.upload().is_err());
        fx.clock.advance(Duration::seconds(60));
        fx.sync.upload().unwrap();
        assert_eq!(load_state(&fx.storage, SyncDomain::Reading).failure_count, 0);
    }

    #[test]
    fn test_today_sync_truncation_schedules_resume() {
        let fx = fixture();
        seed_today(&fx, 500.0);
        fx.api.push_ok(
            endpoints::READING_TIME_TODAY,
            json!({"server_minutes": 120.0, "truncated": true}),
        );

        let outcome = fx.sync.sync_reading_time().unwrap();

        let resume_at = fx.clock.now() + Duration::seconds(35);
        assert_eq!(
            outcome,
            SyncOutcome::Truncated {
                server_minutes: 120.0,
                resume_at
            }
        );
        assert_eq!(
            synced_minutes(&fx, "2024-01-20"),
            Some(120.0)
        );
        assert_eq!(fx.sync.next_deadline(), Some(resume_at));
        assert!(matches!(
            fx.sync.sync_reading_time().unwrap(),
            SyncOutcome::Skipped(SkipReason::NotDue { .. })
        ));

        fx.api.push_ok(
            endpoints::READING_TIME_TODAY,
            json!({"server_minutes": 500.0}),
        );
        fx.clock.advance(Duration::seconds(35));
        let resumed = fx.sync.tick().unwrap();
        assert_eq!(
            resumed.outcome(),
            Some(&SyncOutcome::Completed { changed: 1 })
        );
        assert_eq!(fx.sync.transfer_state(), TransferState::Idle);
    }

    #[test]
    fn test_today_sync_is_idempotent() {
        let fx = fixture();
        seed_today(&fx, 42.0);
        fx.api.respond_always(
            endpoints::READING_TIME_TODAY,
            ApiResponse::ok(json!({"server_minutes": 42.0})),
        );

        fx.sync.sync_reading_time().unwrap();
        assert_eq!(
            fx.sync.sync_reading_time().unwrap(),
            SyncOutcome::Skipped(SkipReason::Unchanged)
        );
        assert_eq!(fx.api.call_count(), 1);
    }

    #[test]
    fn test_today_marker_is_one_key_across_days() {
        let fx = fixture();
        fx.api.respond_always(
            endpoints::READING_TIME_TODAY,
            ApiResponse::ok(json!({"server_minutes": 1.0})),
        );

        for _ in 0..3 {
            let mut ledger: Ledger = fx.storage.get(READING_TIME_KEY).unwrap_or_default();
            ledger.add_minutes(fx.clock.today(), 10.0, fx.clock.now(), 20);
            fx.storage.set(READING_TIME_KEY, &ledger).unwrap();
            fx.sync.sync_reading_time().unwrap();
            fx.clock.advance(Duration::days(1));
        }
        fx.storage.flush();

        let markers: Vec<String> = fx
            .backend
            .keys()
            .into_iter()
            .filter(|key| key.contains(SYNCED_MARKER_KEY))
            .collect();
        assert_eq!(markers.len(), 1);
        assert_eq!(synced_minutes(&fx, "2024-01-22"), Some(10.0));
        assert_eq!(synced_minutes(&fx, "2024-01-20"), None);
    }

    #[test]
    fn test_today_backoff_lifts_once_failures_are_cleared() {
        let fx = fixture();
        seed_today(&fx, 5.0);
        fx.api.push_transport_error(endpoints::READING_TIME_TODAY);

        assert!(fx.sync.sync_reading_time().is_err());
        assert!(matches!(
            fx.sync.transfer_state(),
            TransferState::Backoff { .. }
        ));

        // Another writer to the same store recorded a success meanwhile.
        update_state(&fx.storage, SyncDomain::Reading, |state| {
            state.record_success()
        });
        fx.api.push_ok(
            endpoints::READING_TIME_TODAY,
            json!({"server_minutes": 5.0}),
        );
        assert_eq!(
            fx.sync.sync_reading_time().unwrap(),
            SyncOutcome::Completed { changed: 1 }
        );
        assert_eq!(fx.sync.transfer_state(), TransferState::Idle);
    }

    #[test]
    fn test_rate_limited_sets_pending_resume() {
        let fx = fixture();
        seed_today(&fx, 5.0);
        fx.api.push_ok(
            endpoints::READING_TIME_TODAY,
            json!({"rate_limited": true}),
        );

        let outcome = fx.sync.sync_reading_time().unwrap();
        assert!(matches!(outcome, SyncOutcome::RateLimited { .. }));
        assert_eq!(synced_minutes(&fx, "2024-01-20"), None);
        assert!(matches!(
            fx.sync.transfer_state(),
            TransferState::PendingResume {
                reason: ResumeReason::RateLimited,
                ..
            }
        ));
    }

    #[test]
    fn test_permanent_denial_is_cached() {
        let fx = fixture();
        seed_today(&fx, 5.0);
        fx.api.push(
            endpoints::READING_TIME,
            ApiResponse::failure(codes::INSUFFICIENT_TRUST_LEVEL, "tl0"),
        );

        assert_eq!(
            fx.sync.upload().unwrap(),
            SyncOutcome::Skipped(SkipReason::CapabilityDenied)
        );
        seed_today(&fx, 9.0);
        assert_eq!(
            fx.sync.upload().unwrap(),
            SyncOutcome::Skipped(SkipReason::CapabilityDenied)
        );
        assert_eq!(fx.api.call_count(), 1);
        assert_eq!(load_state(&fx.storage, SyncDomain::Reading).failure_count, 0);
    }

    #[test]
    fn test_requirements_probe_denies_low_trust() {
        let fx = fixture();
        fx.api
            .push_ok(endpoints::TRUST_LEVEL, json!({"trust_level": 1}));

        assert_eq!(
            fx.sync.download_requirements().unwrap(),
            SyncOutcome::Skipped(SkipReason::CapabilityDenied)
        );
        assert_eq!(
            fx.sync.download_requirements().unwrap(),
            SyncOutcome::Skipped(SkipReason::CapabilityDenied)
        );
        assert_eq!(fx.api.call_count(), 1);
    }

    #[test]
    fn test_in_flight_flag_skips() {
        let fx = fixture();
        let _held = fx.sync.begin().unwrap();
        assert_eq!(
            fx.sync.download().unwrap(),
            SyncOutcome::Skipped(SkipReason::InFlight)
        );
        assert_eq!(fx.api.call_count(), 0);
    }

    #[test]
    fn test_not_logged_in_skips() {
        let fx = fixture();
        fx.sync.set_session(None);
        assert_eq!(
            fx.sync.upload().unwrap(),
            SyncOutcome::Skipped(SkipReason::NotLoggedIn)
        );
        assert!(matches!(fx.sync.full_sync(), Err(ReadlogError::NotLoggedIn)));
    }

    #[test]
    fn test_status_reports_domains() {
        let fx = fixture();
        let status = fx.sync.sync_status();
        assert_eq!(status.user_id.as_deref(), Some("u1"));
        assert_eq!(status.domains.len(), 2);
        assert!(!status.syncing);
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["transfer"]["state"], "idle");
    }
}
