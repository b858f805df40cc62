//! Calendar key helpers.
//!
//! Day, month and year keys are plain strings (`2024-01-31`, `2024-01`,
//! `2024`) so they sort chronologically and survive JSON round trips.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, Utc};

pub use readlog_protocol::DAY_KEY_FORMAT;

pub fn local_date(ts: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    ts.with_timezone(&offset).date_naive()
}

pub fn day_key(date: NaiveDate) -> String {
    date.format(DAY_KEY_FORMAT).to_string()
}

pub fn month_key(date: NaiveDate) -> String {
    format!("{:04}-{:02}", date.year(), date.month())
}

pub fn year_key(date: NaiveDate) -> String {
    format!("{:04}", date.year())
}

pub fn parse_day_key(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, DAY_KEY_FORMAT).ok()
}

/// Oldest day still inside the retention window.
pub fn retention_horizon(today: NaiveDate, retention_days: i64) -> NaiveDate {
    today - Duration::days(retention_days)
}

pub fn last_of_month(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|next| next.pred_opt())
        .unwrap_or(date)
}

pub fn millis_to_utc(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}
