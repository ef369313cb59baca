//! Scripted collaborators shared by the integration tests
//!
//! Every double records what it was asked to do in shared state so a test can
//! keep a handle after moving the double into a cache or service.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dbreach::assist::{Embedder, Prompt, TextGenerator};
use dbreach::catalog::Catalog;
use dbreach::connection::{FailureKind, ProbeFailure};
use dbreach::service::Service;
use dbreach::{
    ConnectionCache, ConnectionConfig, DatabaseType, DbReachError, DiscoverySettings, Driver, ProbeOptions,
    ProbeResult, QueryResult, Reachability, Result, RetryPolicy, Session, SqlParam,
};

/// Driver behavior and call log
#[derive(Debug, Default)]
pub struct DriverState {
    /// Ports on which a connect succeeds
    pub accepting: HashSet<u16>,
    /// Connects that fail before the port check applies
    pub fail_next: u32,
    /// Port of every connect call, in order
    pub connects: Vec<u16>,
    /// Sessions handed out so far
    pub opened: u32,
    /// Id of every session that was pinged, in order
    pub pings: Vec<u32>,
    /// Make every liveness check fail
    pub ping_fails: bool,
    /// Make every liveness check wait forever, like a half-open socket
    pub ping_hangs: bool,
    /// Ids of closed sessions
    pub closed: Vec<u32>,
    /// Make `close` fail
    pub close_fails: bool,
    /// Executed statements with their parameters
    pub statements: Vec<(String, Vec<SqlParam>)>,
    /// Results handed out by `execute`, in order; empty result when exhausted
    pub results: VecDeque<QueryResult>,
    pub commits: u32,
}

/// Driver whose behavior is scripted through [`DriverState`]
#[derive(Debug, Clone, Default)]
pub struct ScriptedDriver {
    state: Arc<Mutex<DriverState>>,
}

impl ScriptedDriver {
    pub fn accepting(ports: &[u16]) -> Self {
        let driver = Self::default();
        driver.state().accepting.extend(ports.iter().copied());
        driver
    }

    pub fn state(&self) -> MutexGuard<'_, DriverState> {
        self.state.lock().unwrap()
    }

    pub fn push_result(&self, result: QueryResult) {
        self.state().results.push_back(result);
    }
}

impl Driver for ScriptedDriver {
    type Session = ScriptedSession;

    async fn connect(&self, config: &ConnectionConfig) -> Result<ScriptedSession> {
        let mut state = self.state();
        state.connects.push(config.port);

        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(DbReachError::driver_connect_message("scripted", "server closed the connection"));
        }
        if !state.accepting.contains(&config.port) {
            return Err(DbReachError::driver_connect_message(
                "scripted",
                format!("port {} does not speak the protocol", config.port),
            ));
        }

        state.opened += 1;
        Ok(ScriptedSession { id: state.opened, state: Arc::clone(&self.state) })
    }
}

#[derive(Debug)]
pub struct ScriptedSession {
    pub id: u32,
    state: Arc<Mutex<DriverState>>,
}

impl Session for ScriptedSession {
    async fn execute(&mut self, statement: &str, params: &[SqlParam]) -> Result<QueryResult> {
        let mut state = self.state.lock().unwrap();
        state.statements.push((statement.to_string(), params.to_vec()));
        Ok(state.results.pop_front().unwrap_or_default())
    }

    async fn ping(&mut self) -> Result<()> {
        let hangs = {
            let mut state = self.state.lock().unwrap();
            state.pings.push(self.id);
            if state.ping_fails {
                return Err(DbReachError::stale_connection("server has gone away"));
            }
            state.ping_hangs
        };
        if hangs {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.state.lock().unwrap().commits += 1;
        Ok(())
    }

    async fn close(self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.closed.push(self.id);
        if state.close_fails {
            return Err(DbReachError::query_failed("socket already closed"));
        }
        Ok(())
    }
}

/// Reachability double: listed ports are reachable, the rest refuse
#[derive(Debug, Clone, Default)]
pub struct ScriptedProber {
    reachable: Arc<Mutex<HashSet<u16>>>,
    banners: Arc<Mutex<Vec<(u16, Vec<u8>)>>>,
    probed: Arc<Mutex<Vec<u16>>>,
}

impl ScriptedProber {
    pub fn reachable(ports: &[u16]) -> Self {
        let prober = Self::default();
        prober.reachable.lock().unwrap().extend(ports.iter().copied());
        prober
    }

    pub fn with_banner(self, port: u16, banner: &[u8]) -> Self {
        self.banners.lock().unwrap().push((port, banner.to_vec()));
        self
    }

    pub fn probed(&self) -> Vec<u16> {
        self.probed.lock().unwrap().clone()
    }
}

impl Reachability for ScriptedProber {
    async fn probe(&self, host: &str, port: u16, options: &ProbeOptions) -> ProbeResult {
        self.probed.lock().unwrap().push(port);
        let reachable = self.reachable.lock().unwrap().contains(&port);
        let banner = if reachable && options.read_banner {
            self.banners.lock().unwrap().iter().find(|(p, _)| *p == port).map(|(_, b)| b.clone())
        } else {
            None
        };

        ProbeResult {
            host: host.to_string(),
            port,
            reachable,
            latency: reachable.then(|| Duration::from_millis(3)),
            banner,
            failure: (!reachable).then(|| ProbeFailure {
                kind: FailureKind::Refused,
                message: format!("connection refused by {host}:{port}"),
            }),
            tls: None,
            tls_failure: None,
        }
    }
}

/// Text generator answering with a fixed string and recording prompts
#[derive(Debug, Clone, Default)]
pub struct CannedGenerator {
    pub answer: String,
    pub prompts: Arc<Mutex<Vec<Prompt>>>,
}

impl CannedGenerator {
    pub fn answering(answer: &str) -> Self {
        Self { answer: answer.to_string(), prompts: Arc::default() }
    }
}

impl TextGenerator for CannedGenerator {
    async fn generate(&self, prompt: &Prompt) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.clone());
        Ok(self.answer.clone())
    }
}

/// Embedder returning the text length as a one-element vector
#[derive(Debug, Clone, Default)]
pub struct LengthEmbedder;

impl Embedder for LengthEmbedder {
    #[allow(clippy::cast_precision_loss)]
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(vec![text.len() as f32])
    }
}

pub const HOST: &str = "db.example.internal";

pub fn config(port: u16) -> ConnectionConfig {
    ConnectionConfig::new(DatabaseType::Postgres, HOST, port, "app", "s3cret")
}

/// Fast retry policy for tests that do not measure time
pub fn quick_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_backoff: Duration::from_millis(1),
        connect_timeout: Duration::from_secs(5),
        liveness_timeout: Duration::from_secs(2),
        ..RetryPolicy::default()
    }
}

pub fn cache(
    driver: &ScriptedDriver,
    prober: &ScriptedProber,
    port: u16,
    discovery: DiscoverySettings,
    retry: RetryPolicy,
) -> ConnectionCache<ScriptedDriver, ScriptedProber> {
    ConnectionCache::new(driver.clone(), prober.clone(), config(port), discovery, retry)
}

pub type TestService = Service<ScriptedDriver, ScriptedProber, CannedGenerator, LengthEmbedder>;

pub fn service(
    driver: &ScriptedDriver,
    prober: &ScriptedProber,
    port: u16,
    generator: Option<CannedGenerator>,
) -> TestService {
    let cache = cache(driver, prober, port, DiscoverySettings::with_fallbacks(vec![5432, 6432]), quick_retry(2));
    Service::new(cache, Catalog::new("SMART_RETAIL1").unwrap(), ProbeOptions::default(), generator, Some(LengthEmbedder))
}

pub fn rows(columns: &[&str], rows: Vec<Vec<serde_json::Value>>) -> QueryResult {
    QueryResult { columns: columns.iter().map(ToString::to_string).collect(), rows, rows_affected: None }
}

pub fn affected(n: u64) -> QueryResult {
    QueryResult { rows_affected: Some(n), ..QueryResult::default() }
}
