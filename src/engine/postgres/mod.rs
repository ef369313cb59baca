//! `PostgreSQL` Driver Implementation
//!
//! This module implements [`Driver`] and [`Session`] for `PostgreSQL`.
//!
//! # Features
//! - Client-server connections via TCP, optionally TLS (`native-tls`)
//! - Positional `?` placeholders rewritten to `$n`
//! - Parameters converted to the prepared statement's declared types
//!
//! # Implementation Notes
//! - Uses `tokio-postgres`; the connection future runs on a spawned task
//! - When the server or an intermediary severs the socket, the client starts
//!   failing every call, which is what the cache's liveness check observes
//! - BYTEA data is Base64-encoded for JSON safety

use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio_postgres::config::SslMode;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, Config, NoTls, Row};
use tracing::debug;

use crate::engine::{ConnectionConfig, DatabaseType, Driver, QueryResult, Session, SqlParam};
use crate::error::{DbReachError, Result};

/// `PostgreSQL` driver
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDriver;

/// Live `PostgreSQL` session
pub struct PostgresSession {
    client: Client,
    in_transaction: bool,
}

impl Driver for PostgresDriver {
    type Session = PostgresSession;

    async fn connect(&self, config: &ConnectionConfig) -> Result<PostgresSession> {
        // Validate config is for PostgreSQL
        if config.engine != DatabaseType::Postgres {
            return Err(DbReachError::invalid_input(format!(
                "Expected PostgreSQL engine, got {}",
                config.engine
            )));
        }

        let mut pg_config = build_pg_config(config);

        let client = if config.encrypt {
            pg_config.ssl_mode(SslMode::Require);
            let tls = build_tls_connector(config)?;
            let (client, connection) = pg_config
                .connect(tls)
                .await
                .map_err(|e| DbReachError::driver_connect("postgres", e))?;

            // Spawn connection handler
            // Note: Connection errors are not logged with parameters to prevent credential leakage
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    debug!(error = %e, "postgres connection task ended");
                }
            });
            client
        } else {
            pg_config.ssl_mode(SslMode::Disable);
            let (client, connection) = pg_config
                .connect(NoTls)
                .await
                .map_err(|e| DbReachError::driver_connect("postgres", e))?;

            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    debug!(error = %e, "postgres connection task ended");
                }
            });
            client
        };

        Ok(PostgresSession { client, in_transaction: false })
    }
}

impl Session for PostgresSession {
    async fn execute(&mut self, statement: &str, params: &[SqlParam]) -> Result<QueryResult> {
        let rewritten = rewrite_placeholders(statement);

        let stmt = self
            .client
            .prepare(&rewritten)
            .await
            .map_err(|e| DbReachError::query_failed(format!("Failed to prepare query: {e}")))?;

        if stmt.params().len() != params.len() {
            return Err(DbReachError::invalid_input(format!(
                "Statement expects {} parameters, got {}",
                stmt.params().len(),
                params.len()
            )));
        }

        let bound = stmt
            .params()
            .iter()
            .zip(params)
            .map(|(ty, param)| to_pg_param(param, ty))
            .collect::<Result<Vec<_>>>()?;
        let refs: Vec<&(dyn ToSql + Sync)> = bound.iter().map(|b| b.as_ref() as &(dyn ToSql + Sync)).collect();

        // Statements with result columns return rows
        if stmt.columns().is_empty() {
            let rows_affected = self
                .client
                .execute(&stmt, &refs)
                .await
                .map_err(|e| DbReachError::query_failed(format!("Failed to execute query: {e}")))?;

            Ok(QueryResult { columns: Vec::new(), rows: Vec::new(), rows_affected: Some(rows_affected) })
        } else {
            let rows = self
                .client
                .query(&stmt, &refs)
                .await
                .map_err(|e| DbReachError::query_failed(format!("Failed to execute query: {e}")))?;

            let column_names: Vec<String> = stmt.columns().iter().map(|c| c.name().to_string()).collect();
            let rows = rows.iter().map(|row| row_to_json(&column_names, row)).collect::<Result<Vec<_>>>()?;

            Ok(QueryResult { columns: column_names, rows, rows_affected: None })
        }
    }

    async fn ping(&mut self) -> Result<()> {
        self.client
            .simple_query(DatabaseType::Postgres.liveness_query())
            .await
            .map(|_| ())
            .map_err(|e| DbReachError::stale_connection(format!("PostgreSQL liveness query failed: {e}")))
    }

    async fn begin(&mut self) -> Result<()> {
        if self.in_transaction {
            return Ok(());
        }
        self.client
            .batch_execute("BEGIN")
            .await
            .map_err(|e| DbReachError::query_failed(format!("Failed to begin transaction: {e}")))?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }
        // The transaction is over either way once COMMIT was sent
        self.in_transaction = false;
        self.client
            .batch_execute("COMMIT")
            .await
            .map_err(|e| DbReachError::query_failed(format!("Failed to commit: {e}")))
    }

    async fn close(self) -> Result<()> {
        // Dropping the client closes the socket and ends the spawned connection task
        drop(self.client);
        Ok(())
    }
}

/// Build `PostgreSQL` connection config from `ConnectionConfig`
fn build_pg_config(config: &ConnectionConfig) -> Config {
    // Postgres falls back to a database named after the user
    let db_name = config.database.as_deref().unwrap_or(&config.user);

    let mut pg_config = Config::new();
    pg_config
        .host(&config.host)
        .port(config.port)
        .user(&config.user)
        .password(&config.password)
        .dbname(db_name)
        .application_name("dbreach");

    pg_config
}

fn build_tls_connector(config: &ConnectionConfig) -> Result<MakeTlsConnector> {
    let skip_validation = !config.ssl_validate_certificate;
    let connector = TlsConnector::builder()
        .danger_accept_invalid_certs(skip_validation)
        .danger_accept_invalid_hostnames(skip_validation)
        .build()
        .map_err(|e| DbReachError::driver_connect("postgres", e))?;

    Ok(MakeTlsConnector::new(connector))
}

/// Rewrite positional `?` markers to `$1..$n`, leaving quoted text alone
fn rewrite_placeholders(statement: &str) -> String {
    let mut out = String::with_capacity(statement.len() + 8);
    let mut index = 0;
    let mut quote: Option<char> = None;

    for ch in statement.chars() {
        match (quote, ch) {
            (Some(q), c) if c == q => {
                quote = None;
                out.push(c);
            }
            (Some(_), c) => out.push(c),
            (None, '\'' | '"') => {
                quote = Some(ch);
                out.push(ch);
            }
            (None, '?') => {
                index += 1;
                out.push('$');
                out.push_str(&index.to_string());
            }
            (None, c) => out.push(c),
        }
    }

    out
}

type PgParam = Box<dyn ToSql + Sync + Send>;

/// Convert a positional parameter to the type the server declared for it
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn to_pg_param(param: &SqlParam, ty: &Type) -> Result<PgParam> {
    let mismatch = || {
        DbReachError::invalid_input(format!("Cannot bind {param:?} to PostgreSQL type '{}'", ty.name()))
    };

    let boxed: PgParam = match param {
        SqlParam::Null => typed_null(ty),
        SqlParam::Bool(v) => match *ty {
            Type::BOOL => Box::new(*v),
            _ => Box::new(v.to_string()),
        },
        SqlParam::Int(v) => match *ty {
            Type::INT2 => Box::new(i16::try_from(*v).map_err(|_| mismatch())?),
            Type::INT4 => Box::new(i32::try_from(*v).map_err(|_| mismatch())?),
            Type::INT8 => Box::new(*v),
            Type::FLOAT8 => Box::new(*v as f64),
            Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => Box::new(v.to_string()),
            _ => return Err(mismatch()),
        },
        SqlParam::Float(v) => match *ty {
            Type::FLOAT4 => Box::new(*v as f32),
            Type::FLOAT8 => Box::new(*v),
            _ => return Err(mismatch()),
        },
        SqlParam::Text(v) => match *ty {
            Type::INT2 | Type::INT4 | Type::INT8 => {
                let parsed: i64 = v.trim().parse().map_err(|_| mismatch())?;
                return to_pg_param(&SqlParam::Int(parsed), ty);
            }
            _ => Box::new(v.clone()),
        },
        SqlParam::Bytes(v) => match *ty {
            Type::BYTEA => Box::new(v.clone()),
            _ => return Err(mismatch()),
        },
        SqlParam::Timestamp(v) => match *ty {
            Type::TIMESTAMP => Box::new(*v),
            Type::TIMESTAMPTZ => Box::new(v.and_utc()),
            _ => Box::new(v.format("%Y-%m-%d %H:%M:%S").to_string()),
        },
    };

    Ok(boxed)
}

/// NULL that passes the driver's type check for the declared parameter type
fn typed_null(ty: &Type) -> PgParam {
    match *ty {
        Type::BOOL => Box::new(None::<bool>),
        Type::INT2 => Box::new(None::<i16>),
        Type::INT4 => Box::new(None::<i32>),
        Type::INT8 => Box::new(None::<i64>),
        Type::FLOAT4 => Box::new(None::<f32>),
        Type::FLOAT8 => Box::new(None::<f64>),
        Type::BYTEA => Box::new(None::<Vec<u8>>),
        Type::TIMESTAMP => Box::new(None::<chrono::NaiveDateTime>),
        Type::TIMESTAMPTZ => Box::new(None::<chrono::DateTime<chrono::Utc>>),
        _ => Box::new(None::<String>),
    }
}

/// Convert a `PostgreSQL` row to a JSON-safe `Vec`
fn row_to_json(column_names: &[String], row: &Row) -> Result<Vec<serde_json::Value>> {
    (0..column_names.len()).map(|idx| postgres_value_to_json(row, idx)).collect()
}

/// Convert `PostgreSQL` value to JSON value
fn postgres_value_to_json(row: &Row, idx: usize) -> Result<serde_json::Value> {
    use base64::Engine;

    let column = &row.columns()[idx];
    let col_type = column.type_();
    let fetch_err =
        |e: tokio_postgres::Error| DbReachError::query_failed(format!("Failed to read column '{}': {e}", column.name()));

    let value = match *col_type {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx).map_err(fetch_err)?.map(serde_json::Value::Bool),
        Type::INT2 => row.try_get::<_, Option<i16>>(idx).map_err(fetch_err)?.map(|v| v.into()),
        Type::INT4 => row.try_get::<_, Option<i32>>(idx).map_err(fetch_err)?.map(|v| v.into()),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx).map_err(fetch_err)?.map(|v| v.into()),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .map_err(fetch_err)?
            .map(|v| json_float(f64::from(v))),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx).map_err(fetch_err)?.map(json_float),
        Type::JSON | Type::JSONB => row.try_get::<_, Option<serde_json::Value>>(idx).map_err(fetch_err)?,
        // BYTEA (binary data) - encode as Base64
        Type::BYTEA => row
            .try_get::<_, Option<Vec<u8>>>(idx)
            .map_err(fetch_err)?
            .map(|v| serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(v))),
        Type::TIMESTAMP => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
            .map_err(fetch_err)?
            .map(|v| serde_json::Value::String(v.format("%Y-%m-%dT%H:%M:%S").to_string())),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
            .map_err(fetch_err)?
            .map(|v| serde_json::Value::String(v.to_rfc3339())),
        Type::DATE => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)
            .map_err(fetch_err)?
            .map(|v| serde_json::Value::String(v.format("%Y-%m-%d").to_string())),
        Type::UUID => row
            .try_get::<_, Option<uuid::Uuid>>(idx)
            .map_err(fetch_err)?
            .map(|v| serde_json::Value::String(v.to_string())),
        // Default: try to get as string
        _ => row.try_get::<_, Option<String>>(idx).map_err(|e| {
            DbReachError::query_failed(format!(
                "Failed to convert PostgreSQL type '{}' to JSON: {e}",
                col_type.name()
            ))
        })?
        .map(serde_json::Value::String),
    };

    Ok(value.unwrap_or(serde_json::Value::Null))
}

/// NaN and infinities become null
fn json_float(v: f64) -> serde_json::Value {
    serde_json::Number::from_f64(v).map_or(serde_json::Value::Null, serde_json::Value::Number)
}
