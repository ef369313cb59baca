//! Connection Validator / Cache
//!
//! Single-slot cache holding at most one live session. A cached session is
//! handed out only after it passes the engine's liveness query in the same
//! call; a session that fails it, or does not answer within the liveness
//! timeout, is released (close errors swallowed) and replaced through
//! discovery plus the retrying acquirer.
//!
//! # States
//! - `Empty`: no session cached
//! - `Live`: a session is cached, valid until the next check says otherwise

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::connection::acquire::{acquire, RetryPolicy};
use crate::connection::discovery::{discover, DiscoveryReport, DiscoverySettings};
use crate::connection::probe::{Reachability, TcpProber};
use crate::engine::{ConnectionConfig, Driver, QueryResult, Session, SqlParam};
use crate::error::Result;

/// Cache slot state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    Empty,
    Live,
}

/// Owner of the process's (or session's) single database connection
pub struct ConnectionCache<D: Driver, R: Reachability = TcpProber> {
    driver: D,
    prober: R,
    config: ConnectionConfig,
    configured_port: u16,
    discovery: DiscoverySettings,
    retry: RetryPolicy,
    slot: Option<D::Session>,
    last_discovery: Option<DiscoveryReport>,
}

impl<D: Driver, R: Reachability> ConnectionCache<D, R> {
    pub fn new(driver: D, prober: R, config: ConnectionConfig, discovery: DiscoverySettings, retry: RetryPolicy) -> Self {
        let configured_port = config.port;
        Self { driver, prober, config, configured_port, discovery, retry, slot: None, last_discovery: None }
    }

    #[must_use]
    pub fn state(&self) -> CacheState {
        if self.slot.is_some() {
            CacheState::Live
        } else {
            CacheState::Empty
        }
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state() == CacheState::Live
    }

    /// Working config (port may differ from the configured one when persistence is on)
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Port the operator configured, regardless of discovery
    #[must_use]
    pub fn configured_port(&self) -> u16 {
        self.configured_port
    }

    #[must_use]
    pub fn driver(&self) -> &D {
        &self.driver
    }

    #[must_use]
    pub fn prober(&self) -> &R {
        &self.prober
    }

    #[must_use]
    pub fn discovery_settings(&self) -> &DiscoverySettings {
        &self.discovery
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Report of the most recent discovery pass
    #[must_use]
    pub fn last_discovery(&self) -> Option<&DiscoveryReport> {
        self.last_discovery.as_ref()
    }

    /// Validated cursor over the cached session, reconnecting when needed
    pub async fn get_or_create(&mut self) -> Result<Cursor<'_, D::Session>> {
        if let Some(mut session) = self.slot.take() {
            let bound = self.retry.liveness_timeout;
            match timeout(bound, session.ping()).await {
                Ok(Ok(())) => {
                    debug!("cached connection passed liveness check");
                    return Ok(Cursor::new(self.slot.insert(session)));
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "cached connection failed liveness check, reconnecting");
                    release(session, bound).await;
                }
                Err(_) => {
                    warn!(timeout_ms = bound.as_millis() as u64, "liveness check timed out, reconnecting");
                    release(session, bound).await;
                }
            }
        }

        let session = self.establish().await?;
        info!(state = "live", "connection cached");
        Ok(Cursor::new(self.slot.insert(session)))
    }

    /// Manual teardown; returns whether a session was released
    pub async fn close(&mut self) -> bool {
        match self.slot.take() {
            Some(session) => {
                release(session, self.retry.liveness_timeout).await;
                info!(state = "empty", "connection closed");
                true
            }
            None => false,
        }
    }

    /// Discovery (when enabled) followed by the retrying connect
    async fn establish(&mut self) -> Result<D::Session> {
        let mut working = self.config.clone();

        if self.discovery.enabled {
            let report =
                discover(&self.driver, &self.prober, &self.config, &self.discovery, self.retry.connect_timeout).await;

            match report.discovered {
                Some(port) => {
                    working = self.config.with_port(port);
                    if self.discovery.persist_discovered && port != self.config.port {
                        info!(configured = self.configured_port, discovered = port, "adopting discovered port");
                        self.config = working.clone();
                    }
                }
                None => info!(port = self.config.port, "no candidate accepted, using configured port"),
            }
            self.last_discovery = Some(report);
        }

        acquire(&self.driver, &working, &self.retry).await
    }
}

/// Best-effort release; errors and timeouts are logged and dropped
async fn release<S: Session>(session: S, bound: Duration) {
    match timeout(bound, session.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %err, "ignoring error while releasing connection"),
        Err(_) => warn!(timeout_ms = bound.as_millis() as u64, "gave up releasing connection"),
    }
}

/// Statement cursor over a borrowed session
///
/// Holds the result of the last `execute` and hands its rows out in order.
pub struct Cursor<'c, S: Session> {
    session: &'c mut S,
    result: QueryResult,
    position: usize,
}

impl<'c, S: Session> Cursor<'c, S> {
    fn new(session: &'c mut S) -> Self {
        Self { session, result: QueryResult::default(), position: 0 }
    }

    /// Run a statement with positional `?` parameters, replacing any pending rows
    pub async fn execute(&mut self, statement: &str, params: &[SqlParam]) -> Result<()> {
        self.result = self.session.execute(statement, params).await?;
        self.position = 0;
        Ok(())
    }

    /// Next row of the last result
    pub fn fetch_one(&mut self) -> Option<Vec<Value>> {
        let row = self.result.rows.get(self.position).cloned();
        if row.is_some() {
            self.position += 1;
        }
        row
    }

    /// All remaining rows of the last result
    pub fn fetch_all(&mut self) -> Vec<Vec<Value>> {
        let rows = self.result.rows.get(self.position..).map(<[_]>::to_vec).unwrap_or_default();
        self.position = self.result.rows.len();
        rows
    }

    /// Rows affected by the last statement, or rows returned for queries
    #[must_use]
    pub fn rowcount(&self) -> u64 {
        self.result.rows_affected.unwrap_or(self.result.rows.len() as u64)
    }

    /// Column names of the last result
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.result.columns
    }

    pub async fn begin(&mut self) -> Result<()> {
        self.session.begin().await
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.session.commit().await
    }
}
