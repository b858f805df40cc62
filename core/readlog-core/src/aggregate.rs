//! Per-period counter deltas over the snapshot history.
//!
//! A delta is the last value a counter reached in a period minus the last
//! value it reached before that period. Counters missing from a snapshot keep
//! their previous value, so a failed scrape reads as "no change" rather than a
//! drop to zero. Decreasing counters are not clamped.
//!
//! The three builders are pure functions. [`AggregationEngine`] memoizes their
//! output by (kind, window, input length) and must be invalidated whenever the
//! history is rewritten.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{Datelike, FixedOffset, NaiveDate};
use serde::Serialize;

use crate::clock::Clock;
use crate::dates::{day_key, last_of_month, local_date, month_key};
use crate::history::HistoryEntry;
use crate::lru::LruCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationKind {
    Daily,
    Weekly,
    Monthly,
}

impl AggregationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationKind::Daily => "daily",
            AggregationKind::Weekly => "weekly",
            AggregationKind::Monthly => "monthly",
        }
    }
}

impl std::str::FromStr for AggregationKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "daily" => Ok(AggregationKind::Daily),
            "weekly" => Ok(AggregationKind::Weekly),
            "monthly" => Ok(AggregationKind::Monthly),
            other => Err(format!("unknown aggregation kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeriodDelta {
    pub period: String,
    pub values: BTreeMap<String, i64>,
}

impl PeriodDelta {
    pub fn get(&self, name: &str) -> i64 {
        self.values.get(name).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MemoKey {
    kind: AggregationKind,
    window: i64,
    input_len: usize,
}

/// Snapshots in timestamp order, each with its local calendar date.
fn dated(entries: &[HistoryEntry], offset: FixedOffset) -> Vec<(NaiveDate, &HistoryEntry)> {
    let mut dated: Vec<_> = entries
        .iter()
        .map(|entry| (local_date(entry.ts, offset), entry))
        .collect();
    dated.sort_by_key(|(_, entry)| entry.ts);
    dated
}

/// Groups snapshots by `period_of` and computes each period's delta against
/// the cumulative state at the end of the previous period.
fn grouped_deltas<F>(entries: &[HistoryEntry], offset: FixedOffset, period_of: F) -> Vec<PeriodDelta>
where
    F: Fn(NaiveDate) -> String,
{
    let mut closing: BTreeMap<String, BTreeMap<String, i64>> = BTreeMap::new();
    for (date, entry) in dated(entries, offset) {
        let period = closing.entry(period_of(date)).or_default();
        period.extend(entry.data.iter().map(|(name, value)| (name.clone(), *value)));
    }

    let mut known: BTreeMap<String, i64> = BTreeMap::new();
    let mut deltas = Vec::with_capacity(closing.len());
    for (period, latest) in closing {
        let mut values = BTreeMap::new();
        for (name, value) in latest {
            let previous = known.insert(name.clone(), value).unwrap_or(0);
            values.insert(name, value - previous);
        }
        for name in known.keys() {
            values.entry(name.clone()).or_insert(0);
        }
        deltas.push(PeriodDelta { period, values });
    }
    deltas
}

fn trailing(mut deltas: Vec<PeriodDelta>, window: usize) -> Vec<PeriodDelta> {
    if deltas.len() > window {
        deltas.drain(..deltas.len() - window);
    }
    deltas
}

pub fn daily_deltas(entries: &[HistoryEntry], offset: FixedOffset, window: usize) -> Vec<PeriodDelta> {
    trailing(grouped_deltas(entries, offset, day_key), window)
}

pub fn monthly_deltas(entries: &[HistoryEntry], offset: FixedOffset, window: usize) -> Vec<PeriodDelta> {
    trailing(grouped_deltas(entries, offset, month_key), window)
}

/// Week buckets of the month containing `today`: 1–7, 8–14, 15–21, 22–28 and
/// 29 to month end (absent in a 28-day February).
pub fn week_buckets(today: NaiveDate) -> Vec<(NaiveDate, NaiveDate)> {
    let last = last_of_month(today);
    [1u32, 8, 15, 22, 29]
        .iter()
        .filter_map(|start_day| {
            let start = today.with_day(*start_day)?;
            let end = if *start_day == 29 {
                last
            } else {
                start + chrono::Duration::days(6)
            };
            Some((start, end.min(last)))
        })
        .collect()
}

pub fn weekly_deltas(entries: &[HistoryEntry], offset: FixedOffset, today: NaiveDate) -> Vec<PeriodDelta> {
    let dated = dated(entries, offset);
    let month = month_key(today);

    week_buckets(today)
        .into_iter()
        .enumerate()
        .map(|(index, (start, end))| {
            let mut baseline: BTreeMap<&str, i64> = BTreeMap::new();
            let mut latest: BTreeMap<&str, i64> = BTreeMap::new();
            for (date, entry) in &dated {
                let target = if *date < start {
                    &mut baseline
                } else if *date <= end {
                    &mut latest
                } else {
                    continue;
                };
                for (name, value) in &entry.data {
                    target.insert(name.as_str(), *value);
                }
            }

            let mut values: BTreeMap<String, i64> = baseline
                .keys()
                .map(|name| (name.to_string(), 0))
                .collect();
            for (name, value) in latest {
                let previous = baseline.get(name).copied().unwrap_or(0);
                values.insert(name.to_string(), value - previous);
            }
            PeriodDelta {
                period: format!("{}-W{}", month, index + 1),
                values,
            }
        })
        .collect()
}

fn select(deltas: Vec<PeriodDelta>, names: &[String]) -> Vec<PeriodDelta> {
    if names.is_empty() {
        return deltas;
    }
    deltas
        .into_iter()
        .map(|delta| PeriodDelta {
            values: names
                .iter()
                .map(|name| (name.clone(), delta.get(name)))
                .collect(),
            period: delta.period,
        })
        .collect()
}

/// Memoizing front for the delta builders.
pub struct AggregationEngine {
    clock: Arc<dyn Clock>,
    memo: Mutex<LruCache<MemoKey, Vec<PeriodDelta>>>,
}

impl AggregationEngine {
    pub fn new(clock: Arc<dyn Clock>, capacity: usize) -> Self {
        Self {
            clock,
            memo: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn memoized<F>(&self, key: MemoKey, build: F) -> Vec<PeriodDelta>
    where
        F: FnOnce() -> Vec<PeriodDelta>,
    {
        if let Some(hit) = self
            .memo
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&key)
        {
            return hit;
        }
        let built = build();
        self.memo
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key, built.clone());
        built
    }

    /// Trailing `window` days that have snapshots. An empty `names` returns
    /// every counter seen.
    pub fn daily(&self, entries: &[HistoryEntry], names: &[String], window: usize) -> Vec<PeriodDelta> {
        let offset = self.clock.offset();
        let key = MemoKey {
            kind: AggregationKind::Daily,
            window: window as i64,
            input_len: entries.len(),
        };
        select(self.memoized(key, || daily_deltas(entries, offset, window)), names)
    }

    /// Week buckets of the current month.
    pub fn weekly(&self, entries: &[HistoryEntry], names: &[String]) -> Vec<PeriodDelta> {
        let offset = self.clock.offset();
        let today = self.clock.today();
        let key = MemoKey {
            kind: AggregationKind::Weekly,
            window: today.year() as i64 * 12 + today.month0() as i64,
            input_len: entries.len(),
        };
        select(self.memoized(key, || weekly_deltas(entries, offset, today)), names)
    }

    pub fn monthly(&self, entries: &[HistoryEntry], names: &[String], window: usize) -> Vec<PeriodDelta> {
        let offset = self.clock.offset();
        let key = MemoKey {
            kind: AggregationKind::Monthly,
            window: window as i64,
            input_len: entries.len(),
        };
        select(self.memoized(key, || monthly_deltas(entries, offset, window)), names)
    }

    pub fn compute(
        &self,
        kind: AggregationKind,
        entries: &[HistoryEntry],
        names: &[String],
        window: usize,
    ) -> Vec<PeriodDelta> {
        match kind {
            AggregationKind::Daily => self.daily(entries, names, window),
            AggregationKind::Weekly => self.weekly(entries, names),
            AggregationKind::Monthly => self.monthly(entries, names, window),
        }
    }

    pub fn invalidate(&self) {
        self.memo.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    pub fn memo_len(&self) -> usize {
        self.memo.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{DateTime, TimeZone, Utc};

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn entry(ts: DateTime<Utc>, values: &[(&str, i64)]) -> HistoryEntry {
        HistoryEntry {
            ts,
            data: values
                .iter()
                .map(|(name, value)| (name.to_string(), *value))
                .collect(),
            reading_time: 0.0,
        }
    }

    fn noon(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    fn posts(deltas: &[PeriodDelta]) -> Vec<i64> {
        deltas.iter().map(|delta| delta.get("posts")).collect()
    }

    #[test]
    fn test_daily_deltas_against_previous_day() {
        let entries = vec![
            entry(noon(2024, 1, 1), &[("posts", 10)]),
            entry(noon(2024, 1, 2), &[("posts", 25)]),
            entry(noon(2024, 1, 3), &[("posts", 25)]),
        ];
        let deltas = daily_deltas(&entries, utc(), 30);
        assert_eq!(posts(&deltas), vec![10, 15, 0]);
        assert_eq!(deltas[1].period, "2024-01-02");
    }

    #[test]
    fn test_daily_uses_last_entry_of_day_and_window() {
        let entries = vec![
            entry(noon(2024, 1, 1), &[("posts", 10)]),
            entry(noon(2024, 1, 2) - chrono::Duration::hours(2), &[("posts", 12)]),
            entry(noon(2024, 1, 2), &[("posts", 14)]),
            entry(noon(2024, 1, 3), &[("posts", 20)]),
        ];
        let deltas = daily_deltas(&entries, utc(), 2);
        assert_eq!(deltas.len(), 2);
        assert_eq!(posts(&deltas), vec![4, 6]);
    }

    #[test]
    fn test_missing_counter_carries_forward() {
        let entries = vec![
            entry(noon(2024, 1, 1), &[("posts", 10), ("likes", 5)]),
            entry(noon(2024, 1, 2), &[("posts", 11)]),
            entry(noon(2024, 1, 3), &[("posts", 12), ("likes", 9)]),
        ];
        let deltas = daily_deltas(&entries, utc(), 30);
        let likes: Vec<i64> = deltas.iter().map(|d| d.get("likes")).collect();
        assert_eq!(likes, vec![5, 0, 4]);
    }

    #[test]
    fn test_negative_deltas_are_kept() {
        let entries = vec![
            entry(noon(2024, 1, 1), &[("posts", 10)]),
            entry(noon(2024, 1, 2), &[("posts", 7)]),
        ];
        assert_eq!(posts(&daily_deltas(&entries, utc(), 30)), vec![10, -3]);
    }

    #[test]
    fn test_monthly_deltas() {
        let entries = vec![
            entry(noon(2023, 12, 20), &[("posts", 100)]),
            entry(noon(2024, 1, 5), &[("posts", 120)]),
            entry(noon(2024, 1, 28), &[("posts", 150)]),
            entry(noon(2024, 2, 2), &[("posts", 155)]),
        ];
        let deltas = monthly_deltas(&entries, utc(), 2);
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].period, "2024-01");
        assert_eq!(posts(&deltas), vec![50, 5]);
    }

    #[test]
    fn test_week_buckets_shape() {
        let feb = NaiveDate::from_ymd_opt(2023, 2, 10).unwrap();
        assert_eq!(week_buckets(feb).len(), 4);

        let jan = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        let buckets = week_buckets(jan);
        assert_eq!(buckets.len(), 5);
        assert_eq!(buckets[4].0.day(), 29);
        assert_eq!(buckets[4].1.day(), 31);
    }

    #[test]
    fn test_weekly_baseline_includes_prior_month() {
        let entries = vec![
            entry(noon(2023, 12, 30), &[("posts", 100)]),
            entry(noon(2024, 1, 3), &[("posts", 110)]),
            entry(noon(2024, 1, 6), &[("posts", 115)]),
            entry(noon(2024, 1, 16), &[("posts", 130)]),
        ];
        let today = NaiveDate::from_ymd_opt(2024, 1, 20).unwrap();
        let deltas = weekly_deltas(&entries, utc(), today);

        assert_eq!(deltas.len(), 5);
        assert_eq!(deltas[0].period, "2024-01-W1");
        // Week 2 has no snapshots; week 3 measures against the end of week 1.
        assert_eq!(posts(&deltas), vec![15, 0, 15, 0, 0]);
    }

    #[test]
    fn test_engine_memoizes_until_invalidated() {
        let clock = Arc::new(ManualClock::new(noon(2024, 1, 20)));
        let engine = AggregationEngine::new(clock, 50);
        let entries = vec![entry(noon(2024, 1, 1), &[("posts", 10)])];

        engine.daily(&entries, &[], 7);
        engine.daily(&entries, &["posts".to_string()], 7);
        engine.monthly(&entries, &[], 7);
        assert_eq!(engine.memo_len(), 2);

        engine.invalidate();
        assert_eq!(engine.memo_len(), 0);
    }

    #[test]
    fn test_engine_filters_requested_names() {
        let clock = Arc::new(ManualClock::new(noon(2024, 1, 20)));
        let engine = AggregationEngine::new(clock, 50);
        let entries = vec![entry(noon(2024, 1, 1), &[("posts", 10), ("likes", 3)])];

        let deltas = engine.daily(&entries, &["likes".to_string(), "gone".to_string()], 7);
        assert_eq!(deltas[0].values.len(), 2);
        assert_eq!(deltas[0].get("likes"), 3);
        assert_eq!(deltas[0].get("gone"), 0);
    }
}
