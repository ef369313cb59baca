//! Port Discovery
//!
//! Walks the candidate ports in order (configured port first, then the
//! fallbacks, deduplicated) and returns the first one on which a throwaway
//! driver-level connect succeeds. Unreachable candidates are skipped without
//! touching the driver. Failures are recorded in the report, never raised.

use std::time::Duration;

use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::connection::probe::{ProbeOptions, Reachability};
use crate::engine::{ConnectionConfig, Driver, Session};

/// Port discovery configuration
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    /// Run discovery before the real connect
    pub enabled: bool,
    /// Ports tried after the configured one, in order
    pub fallback_ports: Vec<u16>,
    /// Adopt the discovered port for the rest of the process
    pub persist_discovered: bool,
    /// TCP budget for each candidate's reachability check
    pub probe_timeout: Duration,
}

impl DiscoverySettings {
    /// Defaults with the given fallback list
    #[must_use]
    pub fn with_fallbacks(fallback_ports: impl Into<Vec<u16>>) -> Self {
        Self { enabled: true, fallback_ports: fallback_ports.into(), persist_discovered: false, probe_timeout: Duration::from_secs(8) }
    }

    /// Discovery switched off
    #[must_use]
    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::with_fallbacks(Vec::new()) }
    }
}

/// What happened on one candidate port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateOutcome {
    pub port: u16,
    pub reachable: bool,
    /// Reachability failure, when the probe failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_error: Option<String>,
    /// Whether a driver-level connect was attempted
    pub driver_attempted: bool,
    /// Driver-level rejection, when the connect failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_error: Option<String>,
    pub accepted: bool,
}

/// Result of a discovery pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    pub configured_port: u16,
    /// Candidates actually visited, in order
    pub candidates: Vec<CandidateOutcome>,
    /// First port that accepted the driver connect
    pub discovered: Option<u16>,
}

impl DiscoveryReport {
    /// Port the final connect should use
    #[must_use]
    pub fn effective_port(&self) -> u16 {
        self.discovered.unwrap_or(self.configured_port)
    }
}

/// Configured port first, then fallbacks, first occurrence wins
#[must_use]
pub fn candidate_ports(configured: u16, fallbacks: &[u16]) -> Vec<u16> {
    let mut ports = Vec::with_capacity(fallbacks.len() + 1);
    for port in std::iter::once(configured).chain(fallbacks.iter().copied()) {
        if !ports.contains(&port) {
            ports.push(port);
        }
    }
    ports
}

/// Find the first candidate port that accepts the database protocol
pub async fn discover<D, R>(
    driver: &D,
    prober: &R,
    config: &ConnectionConfig,
    settings: &DiscoverySettings,
    connect_timeout: Duration,
) -> DiscoveryReport
where
    D: Driver,
    R: Reachability,
{
    let probe_options = ProbeOptions::reachability_only(settings.probe_timeout);
    let mut report = DiscoveryReport { configured_port: config.port, candidates: Vec::new(), discovered: None };

    for port in candidate_ports(config.port, &settings.fallback_ports) {
        let probe = prober.probe(&config.host, port, &probe_options).await;
        if !probe.reachable {
            let reason = probe.failure.map(|f| f.message);
            debug!(port, reason = reason.as_deref().unwrap_or("unknown"), "candidate unreachable, skipping");
            report.candidates.push(CandidateOutcome {
                port,
                reachable: false,
                probe_error: reason,
                driver_attempted: false,
                driver_error: None,
                accepted: false,
            });
            continue;
        }

        let candidate = config.with_port(port);
        let driver_error = match timeout(connect_timeout, driver.connect(&candidate)).await {
            Ok(Ok(session)) => {
                // Throwaway connection; close failures do not matter here
                if let Err(err) = session.close().await {
                    debug!(port, error = %err, "ignoring close error on discovery connection");
                }
                None
            }
            Ok(Err(err)) => Some(err.to_string()),
            Err(_) => Some(format!("driver connect timed out after {}ms", connect_timeout.as_millis())),
        };

        let accepted = driver_error.is_none();
        if let Some(error) = &driver_error {
            debug!(port, error = %error, "candidate reachable but driver connect failed");
        }
        report.candidates.push(CandidateOutcome {
            port,
            reachable: true,
            probe_error: None,
            driver_attempted: true,
            driver_error,
            accepted,
        });

        if accepted {
            info!(port, configured = config.port, "discovered database listener");
            report.discovered = Some(port);
            break;
        }
    }

    report
}
