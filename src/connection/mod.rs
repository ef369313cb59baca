//! Connection Subsystem
//!
//! Leaf-first: [`probe`] tests raw reachability, [`discovery`] finds the port
//! that accepts the database protocol, [`acquire`] connects with bounded
//! retries, and [`cache`] keeps one validated session alive.
//!
//! Control flow on a request: cache check → (miss) discovery → acquirer →
//! cached session → cursor.

pub mod acquire;
pub mod cache;
pub mod discovery;
pub mod probe;

pub use acquire::{acquire, BackoffPolicy, RetryPolicy};
pub use cache::{CacheState, ConnectionCache, Cursor};
pub use discovery::{candidate_ports, discover, CandidateOutcome, DiscoveryReport, DiscoverySettings};
pub use probe::{
    classify_banner, FailureKind, ProbeFailure, ProbeOptions, ProbeResult, Reachability, ServiceGuess, TcpProber,
    TlsReport,
};
