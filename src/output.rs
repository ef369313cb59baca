//! Stdout envelopes
//!
//! Every CLI command prints exactly one envelope on stdout, on one line.
//!
//! - Success: `{"ok": true, "engine": "...", "command": "...", "data": {...}, "meta": {...}}`
//! - Error: `{"ok": false, "engine": "...", "command": "...", "error": {"code": "...", "message": "...", "details": [...]}}`
//!
//! `details` is only present when the error carries an attempt history.

use serde::{Deserialize, Serialize};

use crate::error::DbReachError;

/// Envelope printed when a command completes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessEnvelope<T> {
    /// Always true
    pub ok: bool,

    /// Database engine the command ran against (postgres, mysql)
    pub engine: String,

    /// Command that was executed (probe, discover, connect, products.list, ...)
    pub command: String,

    /// Command payload (report, product rows, explanation, ...)
    pub data: T,

    pub meta: Metadata,
}

impl<T> SuccessEnvelope<T> {
    pub fn new(engine: impl Into<String>, command: impl Into<String>, data: T, meta: Metadata) -> Self {
        Self { ok: true, engine: engine.into(), command: command.into(), data, meta }
    }
}

/// Envelope printed when a command fails
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Always false
    pub ok: bool,

    /// Database engine (empty string when configuration never resolved)
    pub engine: String,

    /// Command that was attempted
    pub command: String,

    pub error: ErrorInfo,
}

impl ErrorEnvelope {
    pub fn new(engine: impl Into<String>, command: impl Into<String>, error: ErrorInfo) -> Self {
        Self { ok: false, engine: engine.into(), command: command.into(), error }
    }

    /// Envelope for a library error, carrying its attempt history when exhausted
    pub fn from_error(engine: impl Into<String>, command: impl Into<String>, err: &DbReachError) -> Self {
        Self::new(engine, command, ErrorInfo::from(err))
    }
}

/// Machine-readable failure description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable error code (e.g., "CONNECTION_EXHAUSTED", "CONFIGURATION_MISSING")
    pub code: String,

    /// Human-readable error message (no credentials)
    pub message: String,

    /// Attempt-by-attempt causal chain, when available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<String>>,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into(), details: None }
    }
}

impl From<&DbReachError> for ErrorInfo {
    fn from(err: &DbReachError) -> Self {
        Self { code: err.error_code().to_string(), message: err.message(), details: err.details() }
    }
}

/// Timing attached to every success envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    /// Wall-clock time from settings load to output, in milliseconds
    pub execution_ms: u64,

    /// Row count for product listings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_returned: Option<usize>,
}

impl Metadata {
    pub fn new(execution_ms: u64) -> Self {
        Self { execution_ms, rows_returned: None }
    }

    pub fn with_rows(execution_ms: u64, rows_returned: usize) -> Self {
        Self { execution_ms, rows_returned: Some(rows_returned) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AttemptError, AttemptRecord};

    #[test]
    fn test_product_listing_envelope() {
        let envelope = SuccessEnvelope::new(
            "postgres",
            "products.list",
            serde_json::json!([{"id": 1, "name": "Lamp"}]),
            Metadata::with_rows(42, 10),
        );

        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains(r#""ok":true"#));
        assert!(json.contains(r#""engine":"postgres"#));
        assert!(json.contains(r#""command":"products.list"#));
        assert!(json.contains(r#""execution_ms":42"#));
        assert!(json.contains(r#""rows_returned":10"#));
    }

    #[test]
    fn test_error_envelope_without_details() {
        let envelope =
            ErrorEnvelope::new("mysql", "connect", ErrorInfo::new("CONFIG_ERROR", "bad port"));

        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains(r#""ok":false"#));
        assert!(json.contains(r#""code":"CONFIG_ERROR"#));
        // details omitted when None
        assert!(!json.contains("details"));
    }

    #[test]
    fn test_error_envelope_from_exhausted_connection() {
        let err = DbReachError::from(AttemptError {
            target: "db:443".to_string(),
            attempts: 2,
            last: Box::new(DbReachError::driver_connect_message("postgres", "password rejected")),
            history: vec![
                AttemptRecord {
                    attempt: 1,
                    error: "password rejected".to_string(),
                    backoff: Some(std::time::Duration::from_millis(10)),
                },
                AttemptRecord { attempt: 2, error: "password rejected".to_string(), backoff: None },
            ],
        });
        let envelope = ErrorEnvelope::from_error("postgres", "connect", &err);

        assert!(!envelope.ok);
        assert_eq!(envelope.error.code, "CONNECTION_EXHAUSTED");
        assert!(envelope.error.message.contains("after 2 attempts"));
        assert_eq!(envelope.error.details.as_ref().map(Vec::len), Some(2));
    }

    #[test]
    fn test_probe_metadata_has_no_row_count() {
        let json = serde_json::to_string(&Metadata::new(8001)).unwrap();

        assert_eq!(json, r#"{"execution_ms":8001}"#);
    }
}
