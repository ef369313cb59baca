//! Diagnostics Reporter
//!
//! Read-only presentation of a [`ProbeResult`]: reachability, latency, banner
//! preview, service guess, TLS parameters, and operator hints on failure.
//! Nothing here feeds back into connection decisions.

use serde::Serialize;

use crate::connection::probe::{ProbeFailure, ProbeResult, ServiceGuess, TlsReport};

/// Note attached when the banner looks like HTTP
pub const HTTP_MISMATCH_NOTE: &str = "speaks HTTP, not expected DB wire protocol";

const FAILURE_HINTS: [&str; 2] = [
    "If this is deployed on a hosted platform, outbound connections to non-HTTPS ports may be blocked.",
    "Check that the host and port are correct and that the database is reachable from the public internet or via a gateway.",
];

/// Human-facing probe report
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsReport {
    pub host: String,
    pub port: u16,
    pub reachable: bool,
    /// One-line status
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<ProbeFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banner_preview: Option<String>,
    pub service_guess: ServiceGuess,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_failure: Option<ProbeFailure>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<String>,
}

impl From<&ProbeResult> for DiagnosticsReport {
    fn from(result: &ProbeResult) -> Self {
        let guess = result.guess();
        let latency_ms = result.latency.map(|d| d.as_millis() as u64);

        let summary = match (&result.failure, result.latency) {
            (None, Some(latency)) => format!(
                "TCP connect OK to {}:{} (latency {:.2}s)",
                result.host,
                result.port,
                latency.as_secs_f64()
            ),
            (Some(failure), _) => format!("TCP connection failed: {failure}"),
            (None, None) => format!("TCP connection to {}:{} failed", result.host, result.port),
        };

        let mut notes = Vec::new();
        if guess == ServiceGuess::Http {
            notes.push(format!("port {} {HTTP_MISMATCH_NOTE}", result.port));
        }
        if let Some(tls) = &result.tls {
            notes.push(format!("TLS negotiated {} with {}", tls.protocol, tls.cipher));
        }

        let hints = if result.reachable {
            Vec::new()
        } else {
            FAILURE_HINTS.iter().map(ToString::to_string).collect()
        };

        Self {
            host: result.host.clone(),
            port: result.port,
            reachable: result.reachable,
            summary,
            latency_ms,
            failure: result.failure.clone(),
            banner_preview: result.banner_preview(),
            service_guess: guess,
            tls: result.tls.clone(),
            tls_failure: result.tls_failure.clone(),
            notes,
            hints,
        }
    }
}

impl DiagnosticsReport {
    /// Whether the endpoint answered with HTTP instead of a database protocol
    #[must_use]
    pub fn protocol_mismatch(&self) -> bool {
        self.service_guess == ServiceGuess::Http
    }
}
