//! One-way migration of persisted data into the current layout.
//!
//! Older builds stored the reading ledger in one of two flat shapes:
//!
//! - version 0: `{"2024-01-01": 12.5, ...}` (bare day → minutes map)
//! - version 1: `{"version": 1, "dailyData": {"2024-01-01": 12.5 | {...}}}`
//!   with no rollup caches
//!
//! and kept data under keys that were not scoped to a user. Migration runs once
//! per user, guarded by the `migrated_v2` marker, and is idempotent: running it
//! against already-current data leaves the data unchanged.

use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::dates::parse_day_key;
use crate::ledger::{DayRecord, Ledger, LEDGER_VERSION};
use crate::store::keys::{HISTORY_KEY, MIGRATION_MARKER_KEY, READING_TIME_KEY};
use crate::store::DebouncedStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerShape {
    Current,
    NestedV1,
    Flat,
    Future(u32),
    Unknown,
}

pub fn detect_shape(value: &Value) -> LedgerShape {
    let Some(object) = value.as_object() else {
        return LedgerShape::Unknown;
    };

    match object.get("version").and_then(Value::as_u64) {
        Some(version) if version > LEDGER_VERSION as u64 => LedgerShape::Future(version as u32),
        Some(version) if version == LEDGER_VERSION as u64 => LedgerShape::Current,
        Some(_) if object.contains_key("dailyData") => LedgerShape::NestedV1,
        None if object.contains_key("dailyData") => LedgerShape::NestedV1,
        _ if object.keys().all(|key| parse_day_key(key).is_some()) => LedgerShape::Flat,
        _ => LedgerShape::Unknown,
    }
}

/// Converts any known ledger shape into a current [`Ledger`]. Returns `None`
/// for future or unrecognized shapes, which are left for a newer build.
pub fn upgrade_ledger(value: &Value) -> Option<Ledger> {
    let mut ledger = match detect_shape(value) {
        LedgerShape::Current => serde_json::from_value::<Ledger>(value.clone()).ok()?,
        LedgerShape::NestedV1 => {
            let days = value.get("dailyData").and_then(Value::as_object)?;
            ledger_from_day_map(days)
        }
        LedgerShape::Flat => ledger_from_day_map(value.as_object()?),
        LedgerShape::Future(_) | LedgerShape::Unknown => return None,
    };
    ledger.version = LEDGER_VERSION;
    ledger.rebuild_caches();
    Some(ledger)
}

fn ledger_from_day_map(days: &Map<String, Value>) -> Ledger {
    let mut ledger = Ledger::new();
    for (key, raw) in days {
        if parse_day_key(key).is_none() {
            continue;
        }
        let record = match raw {
            Value::Number(number) => DayRecord {
                total_minutes: number.as_f64().unwrap_or(0.0),
                ..DayRecord::default()
            },
            Value::Object(_) => match serde_json::from_value::<DayRecord>(raw.clone()) {
                Ok(record) => record,
                Err(err) => {
                    warn!(day = %key, error = %err, "Dropping unreadable legacy day");
                    continue;
                }
            },
            _ => continue,
        };
        if record.total_minutes.is_finite() && record.total_minutes > 0.0 {
            ledger.daily_data.insert(key.clone(), record);
        }
    }
    ledger
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub already_migrated: bool,
    pub ledger_upgraded: bool,
    pub adopted_legacy_keys: usize,
}

/// Brings the active user's stored data up to the current layout.
///
/// Writes go through `set_now` so a migrated ledger is durable before any
/// accrual runs against it.
pub fn migrate_user_data(storage: &DebouncedStorage) -> MigrationReport {
    let mut report = MigrationReport::default();
    if storage.get::<bool>(MIGRATION_MARKER_KEY).unwrap_or(false) {
        report.already_migrated = true;
        return report;
    }

    let scoped = storage.get_value(READING_TIME_KEY);
    let source = match scoped {
        Some(value) => Some(value),
        None => {
            let legacy = storage.get_unscoped_value(READING_TIME_KEY);
            if legacy.is_some() {
                report.adopted_legacy_keys += 1;
            }
            legacy
        }
    };

    if let Some(value) = source {
        let shape = detect_shape(&value);
        match upgrade_ledger(&value) {
            Some(ledger) => {
                report.ledger_upgraded = shape != LedgerShape::Current;
                if let Err(err) = storage.set_now(READING_TIME_KEY, &ledger) {
                    warn!(error = %err, "Failed to write migrated ledger; will retry next load");
                    return report;
                }
            }
            None => {
                warn!(shape = ?shape, "Ledger shape not recognized; leaving it untouched");
                return report;
            }
        }
    }

    if storage.get_value(HISTORY_KEY).is_none() {
        if let Some(history) = storage.get_unscoped_value(HISTORY_KEY) {
            if history.is_array() {
                if let Err(err) = storage.set_now(HISTORY_KEY, &history) {
                    warn!(error = %err, "Failed to adopt legacy history");
                    return report;
                }
                report.adopted_legacy_keys += 1;
            }
        }
    }

    if let Err(err) = storage.set_now(MIGRATION_MARKER_KEY, &true) {
        warn!(error = %err, "Failed to persist migration marker");
        return report;
    }
    info!(
        upgraded = report.ledger_upgraded,
        adopted = report.adopted_legacy_keys,
        "Storage migration complete"
    );
    report
}
