//! Time source abstraction.
//!
//! Every component reads "now" through a [`Clock`] so tests can drive idle
//! gaps, debounce windows and backoff deadlines without sleeping.

use chrono::{DateTime, Duration, FixedOffset, Local, NaiveDate, Offset, Utc};
use std::sync::Mutex;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Offset used to derive calendar days. Day keys are computed in this
    /// offset so "today" matches what the user sees.
    fn offset(&self) -> FixedOffset;

    fn today(&self) -> NaiveDate {
        self.now().with_timezone(&self.offset()).date_naive()
    }
}

/// Wall clock in the machine's local timezone.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn offset(&self) -> FixedOffset {
        Local::now().offset().fix()
    }
}

/// Manually advanced clock for tests and replay tooling.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    offset: FixedOffset,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self::with_offset(start, Utc.fix())
    }

    pub fn with_offset(start: DateTime<Utc>, offset: FixedOffset) -> Self {
        Self {
            now: Mutex::new(start),
            offset,
        }
    }

    pub fn set(&self, value: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = value;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn offset(&self) -> FixedOffset {
        self.offset
    }
}
