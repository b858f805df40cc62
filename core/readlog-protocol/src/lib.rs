//! Wire types and validation for the readlog remote sync API.
//!
//! This crate is shared by the sync client and any server or test double so the
//! JSON shapes cannot drift. The server remains the authority on validation, but
//! clients run the same checks before sending so malformed payloads never burn
//! remote write quota.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const API_VERSION: u32 = 1;
pub const MAX_BODY_BYTES: usize = 512 * 1024;
pub const DAY_KEY_FORMAT: &str = "%Y-%m-%d";

/// Endpoint paths, relative to the configured API base URL.
pub mod endpoints {
    pub const READING_TIME: &str = "/reading-time";
    pub const READING_TIME_TODAY: &str = "/reading-time/today";
    pub const REQUIREMENTS_HISTORY: &str = "/requirements/history";
    pub const TRUST_LEVEL: &str = "/user/trust-level";
}

/// Error codes the client distinguishes.
pub mod codes {
    /// Permanent capability denial; cached and suppresses the domain.
    pub const INSUFFICIENT_TRUST_LEVEL: &str = "INSUFFICIENT_TRUST_LEVEL";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const HTTP_ERROR: &str = "HTTP_ERROR";
    pub const INVALID_PAYLOAD: &str = "INVALID_PAYLOAD";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiRequest {
    pub method: Method,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ApiRequest {
    pub fn get() -> Self {
        Self {
            method: Method::Get,
            body: None,
            token: None,
            request_id: None,
        }
    }

    pub fn post(body: Value) -> Self {
        Self {
            method: Method::Post,
            body: Some(body),
            token: None,
            request_id: None,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn is_permanent_denial(&self) -> bool {
        self.code == codes::INSUFFICIENT_TRUST_LEVEL
    }
}

impl ApiResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(code: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    /// Returns the error carried by a failed response, synthesizing one when the
    /// server sent `success: false` without details.
    pub fn error_info(&self) -> Option<ErrorInfo> {
        if self.success {
            return None;
        }
        Some(
            self.error
                .clone()
                .unwrap_or_else(|| ErrorInfo::new(codes::HTTP_ERROR, "request was not successful")),
        )
    }

    /// Decodes `data` into a typed payload. A missing `data` field decodes as JSON
    /// `null`, which succeeds for `Option` and unit-like payloads only.
    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T, ErrorInfo> {
        let data = self.data.clone().unwrap_or(Value::Null);
        serde_json::from_value(data).map_err(|err| {
            ErrorInfo::new(
                codes::INVALID_PAYLOAD,
                format!("response data is invalid: {}", err),
            )
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reading-time payloads
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDay {
    pub total_minutes: f64,
}

/// Remote view of a reading ledger. Used for both download and upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReadingLedgerPayload {
    #[serde(default)]
    pub daily_data: BTreeMap<String, RemoteDay>,
}

impl ReadingLedgerPayload {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        for (day, record) in &self.daily_data {
            validate_day_key(day)?;
            validate_minutes(record.total_minutes, "totalMinutes")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TodaySyncRequest {
    pub date: String,
    pub minutes: f64,
}

impl TodaySyncRequest {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        validate_day_key(&self.date)?;
        validate_minutes(self.minutes, "minutes")
    }
}

/// Response to an incremental reading-time sync.
///
/// `truncated` means the server accepted only `server_minutes` of the reported
/// value (per-request cap); the client is expected to resend the remainder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TodaySyncResponse {
    #[serde(default)]
    pub server_minutes: f64,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default, alias = "rateLimited")]
    pub rate_limited: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrustLevelResponse {
    pub trust_level: u8,
}

// ─────────────────────────────────────────────────────────────────────────────
// Requirements history payloads
// ─────────────────────────────────────────────────────────────────────────────

/// One captured day of counter values. Also the persisted history entry shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    /// Capture time, milliseconds since the Unix epoch.
    pub ts: i64,
    #[serde(default)]
    pub data: BTreeMap<String, i64>,
    #[serde(default)]
    pub reading_time: f64,
}

impl HistoryRecord {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.ts <= 0 {
            return Err(ErrorInfo::new(
                "invalid_timestamp",
                "ts must be a positive millisecond timestamp",
            ));
        }
        validate_minutes(self.reading_time, "readingTime")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HistoryPayload {
    #[serde(default)]
    pub entries: Vec<HistoryRecord>,
}

impl HistoryPayload {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        self.entries.iter().try_for_each(HistoryRecord::validate)
    }
}

pub fn validate_day_key(value: &str) -> Result<(), ErrorInfo> {
    NaiveDate::parse_from_str(value, DAY_KEY_FORMAT)
        .map(|_| ())
        .map_err(|_| {
            ErrorInfo::new(
                "invalid_date",
                format!("{} is not a YYYY-MM-DD date", value),
            )
        })
}

fn validate_minutes(value: f64, field: &str) -> Result<(), ErrorInfo> {
    if value.is_finite() && value >= 0.0 {
        return Ok(());
    }
    Err(ErrorInfo::new(
        "invalid_minutes",
        format!("{} must be a non-negative number", field),
    ))
}
