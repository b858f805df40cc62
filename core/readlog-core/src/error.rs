//! Error types for readlog-core operations.
//!
//! Periodic entry points (ticks, page lifecycle hooks) log these and carry on.
//! Only explicit user-triggered operations hand them back to the caller.

use std::path::PathBuf;

use readlog_protocol::ErrorInfo;

/// All errors that can occur in readlog-core operations.
#[derive(Debug, thiserror::Error)]
pub enum ReadlogError {
    // ─────────────────────────────────────────────────────────────────────
    // Storage Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Storage write failed for key {key}: {details}")]
    StorageWrite { key: String, details: String },

    #[error("Storage file has no parent directory: {0}")]
    StoragePathInvalid(PathBuf),

    // ─────────────────────────────────────────────────────────────────────
    // Session Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("No user is logged in")]
    NotLoggedIn,

    #[error("Session changed while {operation} was in flight")]
    SessionChanged { operation: String },

    // ─────────────────────────────────────────────────────────────────────
    // Sync Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("API call to {endpoint} failed: {code}: {message}")]
    Api {
        endpoint: String,
        code: String,
        message: String,
    },

    #[error("HTTP transport error for {endpoint}: {details}")]
    Transport { endpoint: String, details: String },

    #[error("Invalid payload for {endpoint}: {details}")]
    InvalidPayload { endpoint: String, details: String },

    #[error("Sync domain {domain} is not permitted for this account")]
    CapabilityDenied { domain: String },

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON parsing error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ReadlogError {
    pub fn api(endpoint: &str, info: ErrorInfo) -> Self {
        ReadlogError::Api {
            endpoint: endpoint.to_string(),
            code: info.code,
            message: info.message,
        }
    }
}

/// Convenience type alias for Results using ReadlogError.
pub type Result<T> = std::result::Result<T, ReadlogError>;
