//! The reading-time ledger.
//!
//! Minutes are recorded per calendar day; month and year totals are kept as
//! denormalized caches. Incremental accrual bumps the caches in place, while
//! any bulk mutation (merge, prune, migration) ends with [`Ledger::rebuild_caches`].
//!
//! A day's `total_minutes` only ever grows. The single exception is retention
//! pruning, which drops whole days past the horizon.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use readlog_protocol::{ReadingLedgerPayload, RemoteDay};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::dates::{day_key, month_key, parse_day_key, year_key};

pub const LEDGER_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub time: DateTime<Utc>,
    pub added: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayRecord {
    #[serde(default)]
    pub total_minutes: f64,
    #[serde(default, with = "chrono::serde::ts_milliseconds")]
    pub last_active: DateTime<Utc>,
    #[serde(default)]
    pub sessions: Vec<SessionEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ledger {
    #[serde(default = "current_version", deserialize_with = "known_version")]
    pub version: u32,
    #[serde(default)]
    pub daily_data: BTreeMap<String, DayRecord>,
    #[serde(default)]
    pub monthly_cache: BTreeMap<String, f64>,
    #[serde(default)]
    pub yearly_cache: BTreeMap<String, f64>,
}

fn current_version() -> u32 {
    LEDGER_VERSION
}

/// Ledgers written by a newer build must not parse, or a read-modify-write
/// would silently downgrade them.
fn known_version<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let version = u32::deserialize(deserializer)?;
    if version > LEDGER_VERSION {
        return Err(D::Error::custom(format!(
            "ledger version {} is newer than supported version {}",
            version, LEDGER_VERSION
        )));
    }
    Ok(version)
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            version: LEDGER_VERSION,
            daily_data: BTreeMap::new(),
            monthly_cache: BTreeMap::new(),
            yearly_cache: BTreeMap::new(),
        }
    }

    /// Builds a ledger from a remote payload, adopting it wholesale.
    pub fn from_remote(payload: &ReadingLedgerPayload) -> Self {
        let mut ledger = Self::new();
        ledger.merge_max(&payload.daily_data);
        ledger.rebuild_caches();
        ledger
    }

    pub fn is_empty(&self) -> bool {
        self.daily_data.is_empty()
    }

    pub fn minutes_on(&self, day: &str) -> f64 {
        self.daily_data
            .get(day)
            .map(|record| record.total_minutes)
            .unwrap_or(0.0)
    }

    pub fn month_minutes(&self, month: &str) -> f64 {
        self.monthly_cache.get(month).copied().unwrap_or(0.0)
    }

    pub fn year_minutes(&self, year: &str) -> f64 {
        self.yearly_cache.get(year).copied().unwrap_or(0.0)
    }

    /// Credits `minutes` to `day` and bumps the rollups by the same delta.
    pub fn add_minutes(
        &mut self,
        day: NaiveDate,
        minutes: f64,
        at: DateTime<Utc>,
        session_cap: usize,
    ) {
        if !minutes.is_finite() || minutes <= 0.0 {
            return;
        }

        let record = self.daily_data.entry(day_key(day)).or_default();
        record.total_minutes += minutes;
        record.last_active = at;
        record.sessions.push(SessionEntry {
            time: at,
            added: minutes,
        });
        if record.sessions.len() > session_cap {
            let excess = record.sessions.len() - session_cap;
            record.sessions.drain(..excess);
        }

        *self.monthly_cache.entry(month_key(day)).or_insert(0.0) += minutes;
        *self.yearly_cache.entry(year_key(day)).or_insert(0.0) += minutes;
    }

    /// Recomputes month and year totals from `daily_data`.
    pub fn rebuild_caches(&mut self) {
        self.monthly_cache.clear();
        self.yearly_cache.clear();
        for (key, record) in &self.daily_data {
            let Some(day) = parse_day_key(key) else {
                warn!(day = %key, "Skipping ledger day with malformed key");
                continue;
            };
            *self.monthly_cache.entry(month_key(day)).or_insert(0.0) += record.total_minutes;
            *self.yearly_cache.entry(year_key(day)).or_insert(0.0) += record.total_minutes;
        }
    }

    /// Drops days before `horizon`, plus rollup entries for months and years
    /// that end before it. Returns how many days were removed.
    pub fn prune_before(&mut self, horizon: NaiveDate) -> usize {
        let before = self.daily_data.len();
        self.daily_data
            .retain(|key, _| parse_day_key(key).map_or(false, |day| day >= horizon));
        let removed = before - self.daily_data.len();

        let horizon_month = month_key(horizon);
        let horizon_year = year_key(horizon);
        self.monthly_cache
            .retain(|month, _| month.as_str() >= horizon_month.as_str());
        self.yearly_cache
            .retain(|year, _| year.as_str() >= horizon_year.as_str());
        removed
    }

    /// Max-wins merge of remote days into this ledger.
    ///
    /// Accrual is monotonic, so the larger of two values for a day is always the
    /// more complete one. Returns the number of days that changed; caches are
    /// rebuilt only when something did.
    pub fn merge_max(&mut self, remote: &BTreeMap<String, RemoteDay>) -> usize {
        let mut changed = 0;
        for (key, day) in remote {
            if parse_day_key(key).is_none() {
                warn!(day = %key, "Ignoring remote day with malformed key");
                continue;
            }
            let minutes = day.total_minutes;
            if !minutes.is_finite() || minutes <= 0.0 {
                continue;
            }
            let record = self.daily_data.entry(key.clone()).or_default();
            if minutes > record.total_minutes {
                record.total_minutes = minutes;
                changed += 1;
            }
        }
        if changed > 0 {
            self.rebuild_caches();
        }
        changed
    }

    /// Days within the trailing `window_days` (today included), newest
    /// `max_entries` of them.
    pub fn recent_payload(
        &self,
        today: NaiveDate,
        window_days: i64,
        max_entries: usize,
    ) -> ReadingLedgerPayload {
        let oldest = day_key(today - Duration::days(window_days.saturating_sub(1)));
        let daily_data = self
            .daily_data
            .range(oldest..)
            .rev()
            .take(max_entries)
            .map(|(key, record)| {
                (
                    key.clone(),
                    RemoteDay {
                        total_minutes: record.total_minutes,
                    },
                )
            })
            .collect();
        ReadingLedgerPayload { daily_data }
    }

    /// The whole ledger split into payloads of at most `chunk_size` days,
    /// oldest first.
    pub fn payload_chunks(&self, chunk_size: usize) -> Vec<ReadingLedgerPayload> {
        let chunk_size = chunk_size.max(1);
        let days: Vec<_> = self.daily_data.iter().collect();
        days.chunks(chunk_size)
            .map(|chunk| ReadingLedgerPayload {
                daily_data: chunk
                    .iter()
                    .map(|(key, record)| {
                        (
                            (*key).clone(),
                            RemoteDay {
                                total_minutes: record.total_minutes,
                            },
                        )
                    })
                    .collect(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
    }

    fn remote(entries: &[(&str, f64)]) -> BTreeMap<String, RemoteDay> {
        entries
            .iter()
            .map(|(day, minutes)| {
                (
                    day.to_string(),
                    RemoteDay {
                        total_minutes: *minutes,
                    },
                )
            })
            .collect()
    }

    fn month_sum(ledger: &Ledger, month: &str) -> f64 {
        ledger
            .daily_data
            .iter()
            .filter(|(key, _)| key.starts_with(month))
            .map(|(_, record)| record.total_minutes)
            .sum()
    }

    #[test]
    fn test_add_minutes_updates_rollups() {
        let mut ledger = Ledger::new();
        ledger.add_minutes(date(2024, 1, 15), 1.5, at(), 20);
        ledger.add_minutes(date(2024, 1, 16), 2.0, at(), 20);
        ledger.add_minutes(date(2024, 2, 1), 4.0, at(), 20);

        assert_eq!(ledger.minutes_on("2024-01-15"), 1.5);
        assert_eq!(ledger.month_minutes("2024-01"), 3.5);
        assert_eq!(ledger.year_minutes("2024"), 7.5);
    }

    #[test]
    fn test_add_minutes_ignores_non_positive() {
        let mut ledger = Ledger::new();
        ledger.add_minutes(date(2024, 1, 15), 0.0, at(), 20);
        ledger.add_minutes(date(2024, 1, 15), -3.0, at(), 20);
        ledger.add_minutes(date(2024, 1, 15), f64::NAN, at(), 20);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_session_log_is_capped() {
        let mut ledger = Ledger::new();
        for _ in 0..25 {
            ledger.add_minutes(date(2024, 1, 15), 0.5, at(), 20);
        }
        let record = &ledger.daily_data["2024-01-15"];
        assert_eq!(record.sessions.len(), 20);
        assert_eq!(record.total_minutes, 12.5);
    }

    #[test]
    fn test_merge_takes_max_per_day() {
        let mut ledger = Ledger::new();
        ledger.add_minutes(date(2024, 1, 1), 45.0, at(), 20);
        ledger.add_minutes(date(2024, 1, 2), 60.0, at(), 20);

        let changed = ledger.merge_max(&remote(&[("2024-01-01", 50.0), ("2024-01-02", 50.0)]));

        assert_eq!(changed, 1);
        assert_eq!(ledger.minutes_on("2024-01-01"), 50.0);
        assert_eq!(ledger.minutes_on("2024-01-02"), 60.0);
        assert_eq!(ledger.month_minutes("2024-01"), 110.0);
    }

    #[test]
    fn test_merge_without_changes_reports_zero() {
        let mut ledger = Ledger::new();
        ledger.add_minutes(date(2024, 1, 1), 45.0, at(), 20);
        assert_eq!(ledger.merge_max(&remote(&[("2024-01-01", 10.0)])), 0);
        assert_eq!(ledger.merge_max(&remote(&[("garbage", 100.0)])), 0);
    }

    #[test]
    fn test_missing_version_reads_as_current() {
        let ledger: Ledger = serde_json::from_value(serde_json::json!({
            "dailyData": {"2024-01-01": {"totalMinutes": 4.0}}
        }))
        .unwrap();
        assert_eq!(ledger.version, LEDGER_VERSION);
        assert_eq!(ledger.minutes_on("2024-01-01"), 4.0);
    }

    #[test]
    fn test_newer_version_does_not_parse() {
        let result = serde_json::from_value::<Ledger>(serde_json::json!({
            "version": LEDGER_VERSION + 1,
            "dailyData": {"2024-01-01": {"totalMinutes": 4.0}}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_from_remote_adopts_wholesale() {
        let payload = ReadingLedgerPayload {
            daily_data: remote(&[("2024-01-01", 30.0)]),
        };
        let ledger = Ledger::from_remote(&payload);
        assert_eq!(ledger.minutes_on("2024-01-01"), 30.0);
        assert_eq!(ledger.month_minutes("2024-01"), 30.0);
        assert_eq!(ledger.year_minutes("2024"), 30.0);
    }

    #[test]
    fn test_rebuild_matches_daily_sums() {
        let mut ledger = Ledger::new();
        for day in 1..=28 {
            ledger.add_minutes(date(2024, 2, day), 0.1 * day as f64, at(), 20);
        }
        ledger.merge_max(&remote(&[("2024-02-03", 99.9), ("2024-03-01", 7.0)]));
        ledger.rebuild_caches();

        assert_eq!(ledger.month_minutes("2024-02"), month_sum(&ledger, "2024-02"));
        assert_eq!(ledger.month_minutes("2024-03"), month_sum(&ledger, "2024-03"));
    }

    #[test]
    fn test_prune_drops_old_days_and_rollups() {
        let mut ledger = Ledger::new();
        ledger.add_minutes(date(2022, 12, 31), 5.0, at(), 20);
        ledger.add_minutes(date(2023, 6, 1), 5.0, at(), 20);
        ledger.add_minutes(date(2024, 1, 10), 5.0, at(), 20);

        let removed = ledger.prune_before(date(2023, 6, 1));

        assert_eq!(removed, 1);
        assert!(ledger.daily_data.contains_key("2023-06-01"));
        assert!(!ledger.monthly_cache.contains_key("2022-12"));
        assert!(!ledger.yearly_cache.contains_key("2022"));
        assert!(ledger.yearly_cache.contains_key("2023"));
    }

    #[test]
    fn test_recent_payload_windows_and_caps() {
        let mut ledger = Ledger::new();
        let today = date(2024, 6, 30);
        for offset in 0..120 {
            ledger.add_minutes(today - Duration::days(offset), 1.0, at(), 20);
        }

        let payload = ledger.recent_payload(today, 90, 100);
        assert_eq!(payload.daily_data.len(), 90);
        assert!(payload.daily_data.contains_key("2024-06-30"));
        assert!(!payload.daily_data.contains_key("2024-04-01"));

        let capped = ledger.recent_payload(today, 90, 10);
        assert_eq!(capped.daily_data.len(), 10);
        assert!(capped.daily_data.contains_key("2024-06-30"));
        assert!(!capped.daily_data.contains_key("2024-06-20"));
    }

    #[test]
    fn test_payload_chunks_cover_ledger() {
        let mut ledger = Ledger::new();
        for day in 1..=25 {
            ledger.add_minutes(date(2024, 1, day), 1.0, at(), 20);
        }
        let chunks = ledger.payload_chunks(10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].daily_data.len(), 5);
        let total: usize = chunks.iter().map(|c| c.daily_data.len()).sum();
        assert_eq!(total, 25);
    }

    #[test]
    fn test_serializes_camel_case_layout() {
        let mut ledger = Ledger::new();
        ledger.add_minutes(date(2024, 1, 1), 1.0, at(), 20);
        let value = serde_json::to_value(&ledger).unwrap();
        assert_eq!(value["version"], 2);
        assert_eq!(value["dailyData"]["2024-01-01"]["totalMinutes"], 1.0);
        assert!(value["dailyData"]["2024-01-01"]["lastActive"].is_i64());
        assert_eq!(value["monthlyCache"]["2024-01"], 1.0);
    }
}
