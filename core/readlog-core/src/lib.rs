//! # readlog-core
//!
//! Local-first reading-time tracking with eventual cloud reconciliation.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime dependency. Timers are deadlines the host
//!   polls through `tick()`.
//! - **Thread-safe**: Components are shared through `Arc` and keep their state
//!   behind a `Mutex`; no lock is held across a network call.
//! - **Graceful degradation**: Missing or corrupt files load as empty data,
//!   and sync failures back off instead of surfacing.
//! - **Monotonic**: A day's minutes only grow. Merges take the larger value.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use readlog_core::{ReadlogEngine, StorageConfig, TrackerConfig, UserSession};
//!
//! let engine = ReadlogEngine::open(&StorageConfig::default(), TrackerConfig::default())?;
//! engine.login(UserSession::new("alice", None));
//! engine.on_page_load()?;
//! let summary = engine.summary();
//! ```

pub mod aggregate;
pub mod api;
pub mod clock;
pub mod config;
pub mod dates;
pub mod engine;
pub mod error;
pub mod history;
pub mod ledger;
pub mod lru;
pub mod migrate;
pub mod storage;
pub mod store;
pub mod sync;
pub mod tracker;

pub use aggregate::{AggregationEngine, AggregationKind, PeriodDelta};
pub use api::{ApiClient, HttpApiClient, RecordedCall, ScriptedApiClient};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_config, save_config, TrackerConfig};
pub use engine::{ReadingSummary, ReadlogEngine, TickReport};
pub use error::{ReadlogError, Result};
pub use history::{CounterReading, HistoryEntry, HistoryStore, ScrapeSnapshot};
pub use ledger::{DayRecord, Ledger, SessionEntry, LEDGER_VERSION};
pub use migrate::MigrationReport;
pub use storage::StorageConfig;
pub use store::{DebouncedStorage, FlushReport, JsonFileStore, KeyValueStore, MemoryStore, UserSession};
pub use sync::{
    FullSyncReport, PageLoadReport, SkipReason, StepResult, SyncCoordinator, SyncDomain,
    SyncOutcome, SyncStatus, TransferState,
};
pub use tracker::{accrued_seconds, ActivityState, ReadingTracker};
