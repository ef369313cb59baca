//! Error Handling Infrastructure
//!
//! This module defines all error types used throughout dbreach.
//! All errors are structured and map to specific error codes for JSON output.
//!
//! # Error Categories
//! - `ConfigurationMissing`: Required connection fields absent from every configuration layer
//! - `ConfigError`: Unreadable or malformed configuration sources
//! - `DriverConnect`: A single driver-level connect attempt was rejected
//! - `ConnectionExhausted`: Every attempt in the retry budget failed
//! - `StaleConnection`: A cached session failed its liveness query
//! - `QueryFailed`: Statement execution errors
//! - `InvalidInput`: Malformed input or missing required parameters
//! - `ServiceError`: Text-generation or embedding collaborator failures
//!
//! Reachability failures and protocol mismatches are deliberately absent: the
//! probe reports them as values (see [`crate::connection::probe`]).

use std::time::Duration;

use thiserror::Error;

/// Boxed underlying driver error, kept so the causal chain survives
pub type BoxedSource = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for dbreach operations
#[derive(Error, Debug)]
pub enum DbReachError {
    /// Required connection fields were not provided by any configuration layer
    #[error("Configuration missing: {}", missing.join(", "))]
    ConfigurationMissing { missing: Vec<String> },

    /// Configuration error (file unreadable, invalid TOML, bad value)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The database driver rejected one connection attempt
    #[error("Driver connect failed ({engine}): {detail}")]
    DriverConnect {
        engine: String,
        detail: String,
        #[source]
        source: Option<BoxedSource>,
    },

    /// All retry attempts failed
    #[error("Connection exhausted: {0}")]
    ConnectionExhausted(#[from] AttemptError),

    /// A cached connection failed its liveness check
    #[error("Stale connection: {0}")]
    StaleConnection(String),

    /// Statement execution failed
    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    /// Invalid input or missing required parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// External collaborator (LLM, embedding model) failed
    #[error("Service error ({service}): {detail}")]
    ServiceError { service: String, detail: String },
}

impl DbReachError {
    /// Convert error to error code string for JSON output
    ///
    /// Error codes are stable and suitable for programmatic handling.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::ConfigurationMissing { .. } => "CONFIGURATION_MISSING",
            Self::ConfigError(_) => "CONFIG_ERROR",
            Self::DriverConnect { .. } => "DRIVER_CONNECT_FAILED",
            Self::ConnectionExhausted(_) => "CONNECTION_EXHAUSTED",
            Self::StaleConnection(_) => "STALE_CONNECTION",
            Self::QueryFailed(_) => "QUERY_FAILED",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::ServiceError { .. } => "SERVICE_ERROR",
        }
    }

    /// Get human-readable error message (no credentials)
    #[must_use]
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Extra diagnostic lines for operators
    ///
    /// Only connection exhaustion carries them: one line per attempt followed by
    /// the source chain of the final failure.
    #[must_use]
    pub fn details(&self) -> Option<Vec<String>> {
        match self {
            Self::ConnectionExhausted(attempts) => Some(attempts.causal_chain()),
            _ => None,
        }
    }

    /// Create a configuration-missing error
    pub fn configuration_missing<I, S>(missing: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::ConfigurationMissing { missing: missing.into_iter().map(Into::into).collect() }
    }

    /// Create a configuration error
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    /// Create a driver connect error that keeps the driver's error as its source
    pub fn driver_connect<E>(engine: impl Into<String>, err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::DriverConnect { engine: engine.into(), detail: err.to_string(), source: Some(Box::new(err)) }
    }

    /// Create a driver connect error from a plain message
    pub fn driver_connect_message(engine: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::DriverConnect { engine: engine.into(), detail: detail.into(), source: None }
    }

    /// Create a stale connection error
    pub fn stale_connection(message: impl Into<String>) -> Self {
        Self::StaleConnection(message.into())
    }

    /// Create a query failed error
    pub fn query_failed(message: impl Into<String>) -> Self {
        Self::QueryFailed(message.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create an external service error
    pub fn service_error(service: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ServiceError { service: service.into(), detail: detail.into() }
    }
}

/// One failed connect attempt, as recorded by the acquirer
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    /// 1-based attempt number
    pub attempt: u32,
    /// Rendered error of this attempt
    pub error: String,
    /// Delay slept before the next attempt (None after the final one)
    pub backoff: Option<Duration>,
}

/// Enriched failure raised when the retry budget is spent
///
/// Keeps the final underlying error as its `source()` and the full attempt
/// history for display.
#[derive(Error, Debug)]
#[error("unable to connect to {target} after {attempts} attempts; last error: {last}")]
pub struct AttemptError {
    /// `host:port` that was attempted
    pub target: String,
    /// Number of driver connect calls made
    pub attempts: u32,
    /// Final underlying error
    #[source]
    pub last: Box<DbReachError>,
    /// Every attempt, in order
    pub history: Vec<AttemptRecord>,
}

impl AttemptError {
    /// Description of the last underlying failure
    #[must_use]
    pub fn last_error(&self) -> String {
        self.last.to_string()
    }

    /// Render the attempt history plus the final error's source chain
    #[must_use]
    pub fn causal_chain(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .history
            .iter()
            .map(|record| match record.backoff {
                Some(delay) => format!(
                    "attempt {}/{}: {} (retrying in {}ms)",
                    record.attempt,
                    self.attempts,
                    record.error,
                    delay.as_millis()
                ),
                None => format!("attempt {}/{}: {}", record.attempt, self.attempts, record.error),
            })
            .collect();

        lines.extend(source_chain(self.last.as_ref()).into_iter().map(|cause| format!("caused by: {cause}")));
        lines
    }
}

/// Collect the `source()` chain of an error, outermost first, skipping the error itself
#[must_use]
pub fn source_chain(err: &(dyn std::error::Error + 'static)) -> Vec<String> {
    let mut causes = Vec::new();
    let mut current = err.source();
    while let Some(cause) = current {
        causes.push(cause.to_string());
        current = cause.source();
    }
    causes
}

/// Result type alias for dbreach operations
pub type Result<T> = std::result::Result<T, DbReachError>;
