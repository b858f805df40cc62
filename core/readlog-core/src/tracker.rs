//! Idle-aware reading-time accrual.
//!
//! The tracker keeps a checkpoint (the last instant whose time has been
//! credited) and the instant of the last activity pulse. At each accrual the
//! time since the checkpoint is credited, minus whatever part of the current
//! idle gap exceeds the idle threshold:
//!
//! ```text
//! accrued = elapsed                                if idle_gap <= threshold
//!         = max(0, elapsed - (idle_gap - threshold)) otherwise
//! ```
//!
//! Credits below the noise floor are not written and the checkpoint stays put,
//! so the time carries into the next accrual. Minutes only ever get added to a
//! day; retention pruning of whole days is the only removal.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::TrackerConfig;
use crate::dates::{day_key, local_date, retention_horizon};
use crate::ledger::Ledger;
use crate::store::keys::READING_TIME_KEY;
use crate::store::DebouncedStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityState {
    Active,
    Idle,
}

fn as_seconds(duration: Duration) -> f64 {
    duration.num_milliseconds() as f64 / 1000.0
}

/// Seconds of `elapsed` that count as reading given the current idle gap.
pub fn accrued_seconds(elapsed: Duration, idle_gap: Duration, idle_threshold: Duration) -> f64 {
    let elapsed = as_seconds(elapsed).max(0.0);
    let idle_gap = as_seconds(idle_gap).max(0.0);
    let threshold = as_seconds(idle_threshold);
    if idle_gap <= threshold {
        elapsed
    } else {
        (elapsed - (idle_gap - threshold)).max(0.0)
    }
}

#[derive(Debug)]
struct TrackerState {
    running: bool,
    checkpoint: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    next_accrual: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Persist {
    Debounced,
    Immediate,
}

pub struct ReadingTracker {
    config: TrackerConfig,
    storage: Arc<DebouncedStorage>,
    clock: Arc<dyn Clock>,
    state: Mutex<TrackerState>,
}

impl ReadingTracker {
    pub fn new(config: &TrackerConfig, storage: Arc<DebouncedStorage>, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            config: config.clone(),
            storage,
            clock,
            state: Mutex::new(TrackerState {
                running: false,
                checkpoint: now,
                last_activity: now,
                next_accrual: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Begins tracking. Loading a page counts as activity.
    pub fn start(&self) {
        let now = self.clock.now();
        let mut state = self.lock();
        state.running = true;
        state.checkpoint = now;
        state.last_activity = now;
        state.next_accrual = Some(now + self.config.accrual_interval());
        debug!("Reading tracker started");
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Records a user activity signal. Waking from idle first settles the idle
    /// stretch so that none of it is credited.
    pub fn pulse(&self) {
        let now = self.clock.now();
        if self.state_at(now) == ActivityState::Idle {
            self.settle(now, Persist::Debounced, true);
        }
        self.lock().last_activity = now;
    }

    fn state_at(&self, now: DateTime<Utc>) -> ActivityState {
        let state = self.lock();
        if now - state.last_activity > self.config.idle_threshold() {
            ActivityState::Idle
        } else {
            ActivityState::Active
        }
    }

    pub fn state(&self) -> ActivityState {
        self.state_at(self.clock.now())
    }

    pub fn ledger(&self) -> Ledger {
        self.storage.get(READING_TIME_KEY).unwrap_or_default()
    }

    /// Credits time accumulated since the last checkpoint. Returns the minutes
    /// written, if any.
    pub fn accrue(&self) -> Option<f64> {
        self.settle(self.clock.now(), Persist::Debounced, false)
    }

    fn pending_seconds(&self, now: DateTime<Utc>) -> Option<f64> {
        let state = self.lock();
        if !state.running {
            return None;
        }
        Some(accrued_seconds(
            now - state.checkpoint,
            now - state.last_activity,
            self.config.idle_threshold(),
        ))
    }

    fn settle(&self, now: DateTime<Utc>, persist: Persist, force_checkpoint: bool) -> Option<f64> {
        let seconds = self.pending_seconds(now)?;
        let minutes = seconds / 60.0;

        let floor = match persist {
            Persist::Debounced => self.config.noise_floor_minutes,
            Persist::Immediate => 0.0,
        };
        if minutes <= 0.0 || minutes < floor {
            if seconds <= 0.0 {
                self.lock().checkpoint = now;
            } else if force_checkpoint {
                // Drop the idle stretch but keep the uncredited remainder.
                let carried = Duration::milliseconds((seconds * 1000.0).round() as i64);
                self.lock().checkpoint = now - carried;
            }
            return None;
        }

        match self.persist(minutes, now, persist) {
            Ok(()) => {
                self.lock().checkpoint = now;
                Some(minutes)
            }
            Err(err) => {
                warn!(error = %err, minutes, "Failed to persist accrued reading time");
                None
            }
        }
    }

    fn persist(&self, minutes: f64, now: DateTime<Utc>, persist: Persist) -> crate::error::Result<()> {
        let today = local_date(now, self.clock.offset());
        let horizon = retention_horizon(today, self.config.retention_days);
        let session_cap = self.config.session_log_cap;
        let apply = |ledger: &mut Ledger| {
            ledger.add_minutes(today, minutes, now, session_cap);
            let pruned = ledger.prune_before(horizon);
            if pruned > 0 {
                debug!(pruned, "Pruned reading days past retention");
            }
            true
        };
        match persist {
            Persist::Debounced => self.storage.update(READING_TIME_KEY, apply)?,
            Persist::Immediate => self.storage.update_now(READING_TIME_KEY, apply)?,
        };
        debug!(day = %day_key(today), minutes, "Accrued reading time");
        Ok(())
    }

    /// Persisted minutes for today plus the not-yet-credited projection.
    pub fn current_minutes(&self) -> f64 {
        let now = self.clock.now();
        let persisted = self.ledger().minutes_on(&day_key(local_date(now, self.clock.offset())));
        let projected = self.pending_seconds(now).unwrap_or(0.0) / 60.0;
        persisted + projected
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.lock().next_accrual
    }

    /// Runs the periodic accrual if its deadline has passed.
    pub fn tick(&self) -> Option<f64> {
        let now = self.clock.now();
        {
            let mut state = self.lock();
            match state.next_accrual {
                Some(due) if due <= now => {
                    state.next_accrual = Some(now + self.config.accrual_interval());
                }
                _ => return None,
            }
        }
        self.accrue()
    }

    /// Page-hide/unload: credits everything outstanding with a synchronous
    /// write, then drains the rest of the write buffer.
    pub fn flush_on_hide(&self) {
        let now = self.clock.now();
        self.settle(now, Persist::Immediate, true);
        let report = self.storage.flush();
        if !report.is_clean() {
            warn!(failed = ?report.failed, "Some writes failed while hiding");
        }
    }

    pub fn destroy(&self) {
        if !self.is_running() {
            return;
        }
        self.flush_on_hide();
        let mut state = self.lock();
        state.running = false;
        state.next_accrual = None;
        debug!("Reading tracker stopped");
    }
}
