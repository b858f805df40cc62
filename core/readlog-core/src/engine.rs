//! ReadlogEngine - one user's tracker, history and sync wired together.
//!
//! The engine owns exactly one instance of each component and exposes the page
//! lifecycle the host drives:
//!
//! ```text
//! login ─▶ on_page_load ─▶ (on_activity | on_scrape | tick)* ─▶ on_hide ─▶ destroy
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use readlog_core::{ReadlogEngine, StorageConfig, TrackerConfig, UserSession};
//!
//! let engine = ReadlogEngine::open(&StorageConfig::default(), TrackerConfig::default())?;
//! engine.login(UserSession::new("alice", Some(token)));
//! engine.on_page_load()?;
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::aggregate::{AggregationEngine, AggregationKind, PeriodDelta};
use crate::api::{ApiClient, HttpApiClient};
use crate::clock::{Clock, SystemClock};
use crate::config::TrackerConfig;
use crate::dates::{day_key, month_key, year_key};
use crate::error::{ReadlogError, Result};
use crate::history::{HistoryEntry, HistoryStore, ScrapeSnapshot};
use crate::migrate::{migrate_user_data, MigrationReport};
use crate::storage::StorageConfig;
use crate::store::{DebouncedStorage, FlushReport, JsonFileStore, KeyValueStore, UserSession};
use crate::sync::{PageLoadReport, StepResult, SyncCoordinator};
use crate::tracker::{ActivityState, ReadingTracker};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadingSummary {
    pub day: String,
    pub state: ActivityState,
    pub today_minutes: f64,
    pub month_minutes: f64,
    pub year_minutes: f64,
    pub tracked_days: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub accrued_minutes: Option<f64>,
    pub flushed: Option<FlushReport>,
    pub sync: Option<StepResult>,
}

pub struct ReadlogEngine {
    clock: Arc<dyn Clock>,
    storage: Arc<DebouncedStorage>,
    aggregation: Arc<AggregationEngine>,
    history: Arc<HistoryStore>,
    tracker: ReadingTracker,
    sync: SyncCoordinator,
}

impl ReadlogEngine {
    pub fn new(
        config: TrackerConfig,
        backend: Arc<dyn KeyValueStore>,
        api: Arc<dyn ApiClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let storage = Arc::new(DebouncedStorage::new(backend, clock.clone(), &config));
        let aggregation = Arc::new(AggregationEngine::new(
            clock.clone(),
            config.aggregation_cache_capacity,
        ));
        let history = Arc::new(HistoryStore::new(
            storage.clone(),
            aggregation.clone(),
            clock.clone(),
            &config,
        ));
        let tracker = ReadingTracker::new(&config, storage.clone(), clock.clone());
        let sync = SyncCoordinator::new(&config, storage.clone(), history.clone(), api, clock.clone());

        Self {
            clock,
            storage,
            aggregation,
            history,
            tracker,
            sync,
        }
    }

    /// Production wiring: JSON file store under `storage`, HTTP client, wall clock.
    pub fn open(storage: &StorageConfig, config: TrackerConfig) -> Result<Self> {
        storage.ensure_dirs()?;
        let backend = Arc::new(JsonFileStore::open(&storage.store_file())?);
        let api = Arc::new(HttpApiClient::new(&config)?);
        Ok(Self::new(config, backend, api, Arc::new(SystemClock)))
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Session
    // ─────────────────────────────────────────────────────────────────────────────

    /// Switches to `session`'s user, migrating their stored data if needed.
    pub fn login(&self, session: UserSession) -> MigrationReport {
        if self.storage.user_id().as_deref() != Some(session.user_id.as_str()) {
            self.tracker.destroy();
        }
        let flushed = self.storage.set_user(Some(&session.user_id));
        if !flushed.is_clean() {
            warn!(failed = ?flushed.failed, "Writes for the previous user failed");
        }
        self.aggregation.invalidate();
        let report = migrate_user_data(&self.storage);
        info!(user_id = %session.user_id, "User session started");
        self.sync.set_session(Some(session));
        report
    }

    pub fn logout(&self) {
        self.tracker.destroy();
        self.sync.set_session(None);
        self.storage.set_user(None);
        self.aggregation.invalidate();
        info!("User session ended");
    }

    pub fn current_user(&self) -> Option<String> {
        self.storage.user_id()
    }

    fn require_user(&self) -> Result<()> {
        match self.current_user() {
            Some(_) => Ok(()),
            None => Err(ReadlogError::NotLoggedIn),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Page lifecycle
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn on_page_load(&self) -> Result<PageLoadReport> {
        self.require_user()?;
        self.tracker.start();
        Ok(self.sync.on_page_load())
    }

    pub fn on_activity(&self) {
        self.tracker.pulse();
    }

    /// Records a scrape as today's history entry.
    pub fn on_scrape(&self, snapshot: &ScrapeSnapshot) -> Result<bool> {
        self.require_user()?;
        self.history.record(snapshot, self.tracker.current_minutes())
    }

    pub fn on_hide(&self) {
        self.tracker.flush_on_hide();
    }

    /// Drives every timer whose deadline has passed.
    pub fn tick(&self) -> TickReport {
        TickReport {
            accrued_minutes: self.tracker.tick(),
            flushed: self.storage.poll(),
            sync: self.sync.tick(),
        }
    }

    /// Earliest deadline across the accrual timer, the write buffer and sync.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        [
            self.tracker.next_deadline(),
            self.storage.flush_due(),
            self.sync.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Credits outstanding time, cancels every timer and drains the write
    /// buffer. Safe to call more than once.
    pub fn destroy(&self) -> FlushReport {
        self.tracker.destroy();
        self.sync.destroy();
        self.storage.flush()
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn summary(&self) -> ReadingSummary {
        let today = self.clock.today();
        let ledger = self.tracker.ledger();
        let day = day_key(today);
        let persisted_today = ledger.minutes_on(&day);
        let today_minutes = self.tracker.current_minutes().max(persisted_today);
        let unsaved = today_minutes - persisted_today;
        ReadingSummary {
            state: self.tracker.state(),
            today_minutes,
            month_minutes: ledger.month_minutes(&month_key(today)) + unsaved,
            year_minutes: ledger.year_minutes(&year_key(today)) + unsaved,
            tracked_days: ledger.daily_data.len(),
            day,
        }
    }

    pub fn history_entries(&self) -> Vec<HistoryEntry> {
        self.history.entries()
    }

    pub fn deltas(&self, kind: AggregationKind, names: &[String], window: usize) -> Vec<PeriodDelta> {
        let entries = self.history.entries();
        self.aggregation.compute(kind, &entries, names, window)
    }

    pub fn sync(&self) -> &SyncCoordinator {
        &self.sync
    }

    pub fn tracker(&self) -> &ReadingTracker {
        &self.tracker
    }

    pub fn storage(&self) -> &DebouncedStorage {
        &self.storage
    }
}

impl Drop for ReadlogEngine {
    fn drop(&mut self) {
        let report = self.destroy();
        if !report.is_clean() {
            warn!(failed = ?report.failed, "Writes failed during shutdown");
        }
    }
}
