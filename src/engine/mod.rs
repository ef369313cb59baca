//! Database Engine Traits and Core Types
//!
//! This module defines the driver seam the connection subsystem is built on.
//! Each engine (`PostgreSQL`, `MySQL`) implements [`Driver`] and hands out a
//! [`Session`] that owns exactly one live transport.
//!
//! # Driver Contract
//! - `connect` accepts the full [`ConnectionConfig`] and returns a live session
//! - Sessions expose `execute` (positional `?` parameters), `ping`, `begin`,
//!   `commit`, and `close`
//! - Statements auto-commit unless `begin` opened a transaction
//!
//! # Engine Isolation
//! Each engine implementation is completely independent. [`EngineDriver`]
//! only dispatches on [`ConnectionConfig::engine`].

use std::fmt;
use std::future::Future;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::{DbReachError, Result};

#[cfg(not(any(feature = "postgres", feature = "mysql")))]
compile_error!("enable at least one database engine feature: `postgres` or `mysql`");

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "mysql")]
pub mod mysql;

/// Supported database engine types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// `PostgreSQL` database
    Postgres,
    /// `MySQL` database (includes `MariaDB`)
    MySQL,
}

impl DatabaseType {
    /// Get the engine name as a string
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::MySQL => "mysql",
        }
    }

    /// Trivial round-trip statement used to confirm a session is usable
    #[must_use]
    pub const fn liveness_query(&self) -> &'static str {
        "SELECT 1"
    }

    /// Statement returning the server version string
    #[must_use]
    pub const fn version_query(&self) -> &'static str {
        "SELECT version()"
    }

    /// Short server description from the raw `version()` string
    #[must_use]
    pub fn describe_version(&self, raw: &str) -> String {
        match self {
            // "PostgreSQL 16.1 on x86_64-pc-linux-gnu, compiled by ..."
            Self::Postgres => raw.split_whitespace().take(2).collect::<Vec<_>>().join(" "),
            Self::MySQL => {
                if raw.to_uppercase().contains("MARIADB") {
                    format!("MariaDB {}", raw.split('-').next().unwrap_or("unknown"))
                } else {
                    format!("MySQL {}", raw.split_whitespace().next().unwrap_or(raw))
                }
            }
        }
    }

    /// Well-known alternate listener ports tried after the configured one
    ///
    /// Postgres: native, pgbouncer, secondary cluster. MySQL: native, secondary
    /// instance, X protocol.
    #[must_use]
    pub const fn fallback_ports(&self) -> &'static [u16] {
        match self {
            Self::Postgres => &[5432, 6432, 5433],
            Self::MySQL => &[3306, 3307, 33060],
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DatabaseType {
    type Err = DbReachError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mysql" | "mariadb" => Ok(Self::MySQL),
            other => Err(DbReachError::config_error(format!(
                "Unknown engine '{other}' (expected postgres or mysql)"
            ))),
        }
    }
}

/// Connection parameters handed to the driver
///
/// Constructed once from layered configuration and never mutated in place;
/// port discovery produces derived copies via [`ConnectionConfig::with_port`].
#[derive(Clone, Serialize)]
pub struct ConnectionConfig {
    /// Database engine type
    pub engine: DatabaseType,

    /// Hostname or IP address
    pub host: String,

    /// Listener port
    pub port: u16,

    /// Username (principal)
    pub user: String,

    /// Password (credential)
    /// WARNING: Sensitive data, do not log or include in error messages
    #[serde(skip_serializing)]
    pub password: String,

    /// Database name (Postgres defaults to the user name when absent)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Encrypt the transport
    pub encrypt: bool,

    /// Validate the server certificate when encrypting
    pub ssl_validate_certificate: bool,
}

impl ConnectionConfig {
    /// Create a config with the transport defaults (encrypted, no certificate validation)
    #[must_use]
    pub fn new(
        engine: DatabaseType,
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            host: host.into(),
            port,
            user: user.into(),
            password: password.into(),
            database: None,
            encrypt: true,
            ssl_validate_certificate: false,
        }
    }

    /// Derived copy targeting another port
    #[must_use]
    pub fn with_port(&self, port: u16) -> Self {
        Self { port, ..self.clone() }
    }

    /// `host:port` rendering used in logs and errors
    #[must_use]
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("engine", &self.engine)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("encrypt", &self.encrypt)
            .field("ssl_validate_certificate", &self.ssl_validate_certificate)
            .finish()
    }
}

/// Positional statement parameter
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(NaiveDateTime),
}

impl From<&str> for SqlParam {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for SqlParam {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<Vec<u8>> for SqlParam {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<NaiveDateTime> for SqlParam {
    fn from(value: NaiveDateTime) -> Self {
        Self::Timestamp(value)
    }
}

impl<T: Into<SqlParam>> From<Option<T>> for SqlParam {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Statement execution result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column names in result set
    pub columns: Vec<String>,

    /// Result rows, values in column order
    pub rows: Vec<Vec<serde_json::Value>>,

    /// Number of rows affected (for INSERT/UPDATE/DELETE)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
}

/// Database driver
///
/// Creates sessions. Implementations hold no per-connection state.
pub trait Driver: Send + Sync {
    /// Live session type produced by this driver
    type Session: Session;

    /// Open a session with the full config (host, port, principal, credential, TLS flags)
    fn connect(&self, config: &ConnectionConfig) -> impl Future<Output = Result<Self::Session>> + Send;
}

/// One live database session
pub trait Session: Send {
    /// Execute a statement with positional `?` parameters
    fn execute(
        &mut self,
        statement: &str,
        params: &[SqlParam],
    ) -> impl Future<Output = Result<QueryResult>> + Send;

    /// Run the engine's liveness query
    fn ping(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Open an explicit transaction
    fn begin(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Commit the open transaction (no-op when none is open)
    fn commit(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Release the transport
    fn close(self) -> impl Future<Output = Result<()>> + Send;
}

/// Driver dispatching to the compiled-in engines
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineDriver;

/// Session of whichever engine [`EngineDriver`] connected to
pub enum EngineSession {
    #[cfg(feature = "postgres")]
    Postgres(postgres::PostgresSession),
    #[cfg(feature = "mysql")]
    MySql(mysql::MySqlSession),
}

impl Driver for EngineDriver {
    type Session = EngineSession;

    async fn connect(&self, config: &ConnectionConfig) -> Result<EngineSession> {
        match config.engine {
            #[cfg(feature = "postgres")]
            DatabaseType::Postgres => {
                postgres::PostgresDriver.connect(config).await.map(EngineSession::Postgres)
            }
            #[cfg(feature = "mysql")]
            DatabaseType::MySQL => mysql::MySqlDriver.connect(config).await.map(EngineSession::MySql),
            #[allow(unreachable_patterns)]
            other => Err(DbReachError::invalid_input(format!(
                "Engine '{other}' is not compiled into this build"
            ))),
        }
    }
}

impl Session for EngineSession {
    async fn execute(&mut self, statement: &str, params: &[SqlParam]) -> Result<QueryResult> {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(session) => session.execute(statement, params).await,
            #[cfg(feature = "mysql")]
            Self::MySql(session) => session.execute(statement, params).await,
        }
    }

    async fn ping(&mut self) -> Result<()> {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(session) => session.ping().await,
            #[cfg(feature = "mysql")]
            Self::MySql(session) => session.ping().await,
        }
    }

    async fn begin(&mut self) -> Result<()> {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(session) => session.begin().await,
            #[cfg(feature = "mysql")]
            Self::MySql(session) => session.begin().await,
        }
    }

    async fn commit(&mut self) -> Result<()> {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(session) => session.commit().await,
            #[cfg(feature = "mysql")]
            Self::MySql(session) => session.commit().await,
        }
    }

    async fn close(self) -> Result<()> {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(session) => session.close().await,
            #[cfg(feature = "mysql")]
            Self::MySql(session) => session.close().await,
        }
    }
}
