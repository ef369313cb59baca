//! dbreach - Database Endpoint Discovery and Validated Connection Reuse
//!
//! dbreach locates a working database endpoint on a network that may only
//! expose some ports, acquires a connection with bounded retries, and keeps
//! that connection cached for reuse only after it passes a liveness check.
//! A small product-catalog surface runs on top of the cached connection.
//!
//! # Core Principles
//! - Machine-readable interface (JSON envelopes on stdout, logs on stderr)
//! - Reachability failures are reported as data, never raised
//! - A cached connection is never handed out unvalidated
//! - Every network call is bounded by a timeout
//!
//! # Architecture
//! This library provides the core functionality for both the CLI and the
//! stdio session. Both interfaces are thin wrappers over [`service::Service`].
//!
//! # Module Organization
//! - [`error`] - Error types and handling
//! - [`output`] - JSON output envelope types
//! - [`engine`] - Driver seam plus the `PostgreSQL` and `MySQL` sessions
//! - [`connection`] - Reachability probe, port discovery, retrying acquirer, connection cache
//! - [`diagnostics`] - Operator-facing probe reports
//! - [`config`] - Layered configuration (secrets file, environment, prompts)
//! - [`catalog`] - Product-table operations
//! - [`assist`] - Text generation and embedding collaborators
//! - [`service`] - Operations shared by the CLI and the session
//! - [`session`] - JSON-RPC 2.0 over stdio

pub mod assist;
pub mod catalog;
pub mod config;
pub mod connection;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod output;
pub mod service;
pub mod session;

// Re-export commonly used types for convenience
pub use config::{resolve, Settings};
pub use connection::{
    acquire, candidate_ports, classify_banner, discover, BackoffPolicy, CacheState, ConnectionCache, Cursor,
    DiscoveryReport, DiscoverySettings, ProbeOptions, ProbeResult, Reachability, RetryPolicy, ServiceGuess, TcpProber,
};
pub use diagnostics::DiagnosticsReport;
pub use engine::{ConnectionConfig, DatabaseType, Driver, EngineDriver, QueryResult, Session, SqlParam};
pub use error::{AttemptError, AttemptRecord, DbReachError, Result};
pub use output::{ErrorEnvelope, ErrorInfo, Metadata, SuccessEnvelope};
pub use service::{DefaultService, Service};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_api_exports() {
        let config = ConnectionConfig::new(DatabaseType::MySQL, "db.internal", 3306, "app", "secret");
        assert_eq!(config.target(), "db.internal:3306");
        assert_eq!(RetryPolicy::default().attempts(), 3);
        assert_eq!(classify_banner(None), ServiceGuess::Silent);
        assert_eq!(candidate_ports(3306, DatabaseType::MySQL.fallback_ports()), vec![3306, 3307, 33060]);
    }
}
