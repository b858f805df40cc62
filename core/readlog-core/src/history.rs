//! Daily log of scraped counter snapshots.
//!
//! One entry per local calendar day; a later scrape on the same day replaces
//! that day's entry. Entries older than the retention horizon are dropped on
//! every write. Every mutation invalidates the aggregation memo.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use readlog_protocol::HistoryRecord;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::aggregate::AggregationEngine;
use crate::clock::Clock;
use crate::config::TrackerConfig;
use crate::dates::{local_date, millis_to_utc, retention_horizon};
use crate::error::Result;
use crate::store::keys::HISTORY_KEY;
use crate::store::DebouncedStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterReading {
    pub value: i64,
    pub ok: bool,
}

/// Counter values keyed by name, as handed over by the scrape provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScrapeSnapshot {
    pub values: BTreeMap<String, CounterReading>,
}

impl ScrapeSnapshot {
    pub fn successful(&self) -> BTreeMap<String, i64> {
        self.values
            .iter()
            .filter(|(_, reading)| reading.ok)
            .map(|(name, reading)| (name.clone(), reading.value))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub data: BTreeMap<String, i64>,
    #[serde(default)]
    pub reading_time: f64,
}

impl HistoryEntry {
    pub fn to_record(&self) -> HistoryRecord {
        HistoryRecord {
            ts: self.ts.timestamp_millis(),
            data: self.data.clone(),
            reading_time: self.reading_time,
        }
    }

    pub fn from_record(record: &HistoryRecord) -> Option<Self> {
        Some(Self {
            ts: millis_to_utc(record.ts)?,
            data: record.data.clone(),
            reading_time: record.reading_time,
        })
    }
}

pub struct HistoryStore {
    storage: Arc<DebouncedStorage>,
    aggregation: Arc<AggregationEngine>,
    clock: Arc<dyn Clock>,
    retention_days: i64,
}

impl HistoryStore {
    pub fn new(
        storage: Arc<DebouncedStorage>,
        aggregation: Arc<AggregationEngine>,
        clock: Arc<dyn Clock>,
        config: &TrackerConfig,
    ) -> Self {
        Self {
            storage,
            aggregation,
            clock,
            retention_days: config.retention_days,
        }
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.storage.get(HISTORY_KEY).unwrap_or_default()
    }

    pub fn entries_since(&self, since: DateTime<Utc>) -> Vec<HistoryEntry> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.ts > since)
            .collect()
    }

    /// Records today's snapshot. Only counters that scraped successfully are
    /// kept; a snapshot with none is ignored.
    pub fn record(&self, snapshot: &ScrapeSnapshot, reading_time: f64) -> Result<bool> {
        let data = snapshot.successful();
        if data.is_empty() {
            debug!("Scrape produced no usable counters; history unchanged");
            return Ok(false);
        }

        let now = self.clock.now();
        let offset = self.clock.offset();
        let today = local_date(now, offset);
        let horizon = retention_horizon(today, self.retention_days);

        let entry = HistoryEntry {
            ts: now,
            data,
            reading_time,
        };
        self.storage.update(HISTORY_KEY, |entries: &mut Vec<HistoryEntry>| {
            entries.retain(|existing| {
                let day = local_date(existing.ts, offset);
                day != today && day >= horizon
            });
            entries.push(entry);
            entries.sort_by_key(|existing| existing.ts);
            true
        })?;
        self.aggregation.invalidate();
        Ok(true)
    }

    /// Folds remote entries in. Per day, the entry with the later timestamp
    /// wins. Returns how many days changed.
    pub fn merge_remote(&self, remote: &[HistoryRecord]) -> Result<usize> {
        let offset = self.clock.offset();
        let horizon = retention_horizon(self.clock.today(), self.retention_days);

        let incoming: Vec<HistoryEntry> = remote
            .iter()
            .filter_map(|record| {
                let entry = HistoryEntry::from_record(record);
                if entry.is_none() {
                    warn!(ts = record.ts, "Dropping remote history entry with invalid timestamp");
                }
                entry
            })
            .filter(|entry| local_date(entry.ts, offset) >= horizon)
            .collect();
        if incoming.is_empty() {
            return Ok(0);
        }

        let mut changed = 0;
        self.storage.update(HISTORY_KEY, |entries: &mut Vec<HistoryEntry>| {
            let mut by_day: BTreeMap<_, HistoryEntry> = entries
                .drain(..)
                .map(|entry| (local_date(entry.ts, offset), entry))
                .collect();
            for entry in incoming {
                let day = local_date(entry.ts, offset);
                let newer = by_day
                    .get(&day)
                    .map_or(true, |existing| entry.ts > existing.ts);
                if newer {
                    by_day.insert(day, entry);
                    changed += 1;
                }
            }
            entries.extend(by_day.into_values());
            changed > 0
        })?;

        if changed > 0 {
            self.aggregation.invalidate();
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};

    struct Fixture {
        clock: Arc<ManualClock>,
        aggregation: Arc<AggregationEngine>,
        history: HistoryStore,
    }

    fn fixture() -> Fixture {
        let config = TrackerConfig::default();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 10, 9, 0, 0).unwrap(),
        ));
        let storage = Arc::new(DebouncedStorage::new(
            Arc::new(MemoryStore::new()),
            clock.clone(),
            &config,
        ));
        storage.set_user(Some("u1"));
        let aggregation = Arc::new(AggregationEngine::new(clock.clone(), 50));
        let history = HistoryStore::new(storage, aggregation.clone(), clock.clone(), &config);
        Fixture {
            clock,
            aggregation,
            history,
        }
    }

    fn snapshot(values: &[(&str, i64, bool)]) -> ScrapeSnapshot {
        ScrapeSnapshot {
            values: values
                .iter()
                .map(|(name, value, ok)| {
                    (
                        name.to_string(),
                        CounterReading {
                            value: *value,
                            ok: *ok,
                        },
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn test_same_day_overwrites() {
        let fx = fixture();
        fx.history.record(&snapshot(&[("posts", 1, true)]), 3.0).unwrap();
        fx.clock.advance(Duration::hours(2));
        fx.history.record(&snapshot(&[("posts", 4, true)]), 5.0).unwrap();

        let entries = fx.history.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].data["posts"], 4);
        assert_eq!(entries[0].reading_time, 5.0);

        fx.clock.advance(Duration::days(1));
        fx.history.record(&snapshot(&[("posts", 6, true)]), 0.0).unwrap();
        assert_eq!(fx.history.entries().len(), 2);
    }

    #[test]
    fn test_failed_counters_are_not_recorded() {
        let fx = fixture();
        let recorded = fx
            .history
            .record(&snapshot(&[("posts", 1, true), ("likes", 0, false)]), 0.0)
            .unwrap();
        assert!(recorded);
        assert!(!fx.history.entries()[0].data.contains_key("likes"));

        let recorded = fx.history.record(&snapshot(&[("likes", 0, false)]), 0.0).unwrap();
        assert!(!recorded);
    }

    #[test]
    fn test_record_prunes_past_retention() {
        let fx = fixture();
        fx.history.record(&snapshot(&[("posts", 1, true)]), 0.0).unwrap();
        fx.clock.advance(Duration::days(400));
        fx.history.record(&snapshot(&[("posts", 2, true)]), 0.0).unwrap();
        assert_eq!(fx.history.entries().len(), 1);
    }

    #[test]
    fn test_record_invalidates_aggregation() {
        let fx = fixture();
        fx.history.record(&snapshot(&[("posts", 1, true)]), 0.0).unwrap();
        let entries = fx.history.entries();
        fx.aggregation.daily(&entries, &[], 7);
        assert_eq!(fx.aggregation.memo_len(), 1);

        fx.history.record(&snapshot(&[("posts", 2, true)]), 0.0).unwrap();
        assert_eq!(fx.aggregation.memo_len(), 0);
    }

    #[test]
    fn test_merge_remote_keeps_later_entry_per_day() {
        let fx = fixture();
        fx.history.record(&snapshot(&[("posts", 5, true)]), 0.0).unwrap();
        let local_ts = fx.history.entries()[0].ts.timestamp_millis();

        let remote = vec![
            HistoryRecord {
                ts: local_ts - 60_000,
                data: BTreeMap::from([("posts".to_string(), 1)]),
                reading_time: 0.0,
            },
            HistoryRecord {
                ts: local_ts - 86_400_000,
                data: BTreeMap::from([("posts".to_string(), 3)]),
                reading_time: 2.0,
            },
        ];
        let changed = fx.history.merge_remote(&remote).unwrap();

        assert_eq!(changed, 1);
        let entries = fx.history.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].data["posts"], 5);
        assert_eq!(entries[0].data["posts"], 3);
    }

    #[test]
    fn test_snapshot_parses_provider_shape() {
        let parsed: ScrapeSnapshot =
            serde_json::from_str(r#"{"posts": {"value": 3, "ok": true}}"#).unwrap();
        assert_eq!(parsed.successful()["posts"], 3);
    }
}
