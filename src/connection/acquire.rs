//! Connection Acquirer
//!
//! Bounded retry-with-backoff around the driver's connect call. Every failed
//! attempt is recorded; exhaustion raises [`DbReachError::ConnectionExhausted`]
//! carrying the full history and the last underlying error as its source.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::engine::{ConnectionConfig, Driver};
use crate::error::{AttemptError, AttemptRecord, DbReachError, Result};

/// Growth of the delay between attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffPolicy {
    /// `base × 2^(k−1)`
    #[default]
    Exponential,
    /// `base × k`
    Linear,
}

impl FromStr for BackoffPolicy {
    type Err = DbReachError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            other => Err(DbReachError::config_error(format!(
                "Unknown backoff policy '{other}' (expected exponential or linear)"
            ))),
        }
    }
}

/// Retry budget for the final connect
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Driver connect calls before giving up (0 is treated as 1)
    pub max_attempts: u32,
    /// Base delay between attempts
    pub base_backoff: Duration,
    pub backoff: BackoffPolicy,
    /// Bound on each individual driver connect
    pub connect_timeout: Duration,
    /// Bound on the liveness query run before a cached session is reused
    pub liveness_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1500),
            backoff: BackoffPolicy::Exponential,
            connect_timeout: Duration::from_secs(10),
            liveness_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Effective attempt count
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay slept after failed attempt `attempt` (1-based); saturates
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let factor = match self.backoff {
            BackoffPolicy::Exponential => match 2_u32.checked_pow(attempt - 1) {
                Some(factor) => factor,
                None => return Duration::MAX,
            },
            BackoffPolicy::Linear => attempt,
        };
        self.base_backoff.checked_mul(factor).unwrap_or(Duration::MAX)
    }

    /// Every delay the acquirer may sleep, in order
    #[must_use]
    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.attempts()).map(|attempt| self.delay_after(attempt)).collect()
    }
}

/// Connect with retries; returns the first live session
pub async fn acquire<D: Driver>(driver: &D, config: &ConnectionConfig, policy: &RetryPolicy) -> Result<D::Session> {
    let attempts = policy.attempts();
    let engine = config.engine.as_str();
    let mut history = Vec::with_capacity(attempts as usize);
    let mut last_error = None;

    for attempt in 1..=attempts {
        info!(endpoint = %config.target(), attempt, attempts, "connecting");

        let outcome = match timeout(policy.connect_timeout, driver.connect(config)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(DbReachError::driver_connect_message(
                engine,
                format!("connect timed out after {}ms", policy.connect_timeout.as_millis()),
            )),
        };

        match outcome {
            Ok(session) => {
                info!(endpoint = %config.target(), attempt, "connected");
                return Ok(session);
            }
            Err(err) => {
                let backoff = (attempt < attempts).then(|| policy.delay_after(attempt));
                warn!(
                    endpoint = %config.target(),
                    attempt,
                    attempts,
                    backoff_ms = backoff.map(|d| d.as_millis() as u64),
                    error = %err,
                    "connect attempt failed"
                );
                history.push(AttemptRecord { attempt, error: err.to_string(), backoff });
                last_error = Some(err);

                if let Some(delay) = backoff {
                    sleep(delay).await;
                }
            }
        }
    }

    let last = last_error.unwrap_or_else(|| DbReachError::driver_connect_message(engine, "no connect attempt was made"));
    Err(AttemptError { target: config.target(), attempts, last: Box::new(last), history }.into())
}
