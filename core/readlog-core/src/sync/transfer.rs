//! State of the today-minutes transfer.
//!
//! ```text
//! Idle ──begin──▶ InFlight ──┬─▶ Idle            (accepted)
//!                            ├─▶ PendingResume   (truncated or rate limited)
//!                            └─▶ Backoff         (failed)
//! PendingResume / Backoff ──deadline──▶ due for another attempt
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeReason {
    Truncated,
    RateLimited,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TransferState {
    #[default]
    Idle,
    InFlight,
    PendingResume {
        resume_at: DateTime<Utc>,
        reason: ResumeReason,
    },
    Backoff {
        until: DateTime<Utc>,
    },
}

impl TransferState {
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        match self {
            TransferState::PendingResume { resume_at, .. } => Some(*resume_at),
            TransferState::Backoff { until } => Some(*until),
            TransferState::Idle | TransferState::InFlight => None,
        }
    }

    /// True when a waiting state has reached its deadline.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.deadline().map_or(false, |deadline| now >= deadline)
    }

    /// Whether a new attempt may start now.
    pub fn can_begin(&self, now: DateTime<Utc>) -> bool {
        match self {
            TransferState::Idle => true,
            TransferState::InFlight => false,
            TransferState::PendingResume { .. } | TransferState::Backoff { .. } => self.is_due(now),
        }
    }
}
