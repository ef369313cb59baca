//! `MySQL` Driver Implementation
//!
//! This module implements [`Driver`] and [`Session`] for `MySQL` databases (including `MariaDB`).
//!
//! # Implementation Notes
//! - Uses `mysql_async` (async driver, requires tokio runtime)
//! - Statements are prepared server-side; `?` placeholders are native
//! - TLS via rustls when `encrypt` is set
//! - ENUM and SET types arrive as strings
//! - BLOB data is Base64-encoded for JSON safety

use chrono::{Datelike, Timelike};
use mysql_async::{prelude::*, Conn, OptsBuilder, Params, Row, SslOpts, Value};

use crate::engine::{ConnectionConfig, DatabaseType, Driver, QueryResult, Session, SqlParam};
use crate::error::{DbReachError, Result};

/// `MySQL` driver
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDriver;

/// Live `MySQL` session
pub struct MySqlSession {
    conn: Conn,
    in_transaction: bool,
}

impl Driver for MySqlDriver {
    type Session = MySqlSession;

    async fn connect(&self, config: &ConnectionConfig) -> Result<MySqlSession> {
        // Validate config is for MySQL
        if config.engine != DatabaseType::MySQL {
            return Err(DbReachError::invalid_input(format!("Expected MySQL engine, got {}", config.engine)));
        }

        let conn = Conn::new(build_mysql_opts(config)).await.map_err(|e| DbReachError::driver_connect("mysql", e))?;

        Ok(MySqlSession { conn, in_transaction: false })
    }
}

impl Session for MySqlSession {
    async fn execute(&mut self, statement: &str, params: &[SqlParam]) -> Result<QueryResult> {
        let params = if params.is_empty() {
            Params::Empty
        } else {
            Params::Positional(params.iter().map(to_mysql_value).collect())
        };

        let mut result = self
            .conn
            .exec_iter(statement, params)
            .await
            .map_err(|e| DbReachError::query_failed(format!("Failed to execute query: {e}")))?;

        let column_names: Vec<String> = result
            .columns_ref()
            .iter()
            .map(|col| col.name_str().to_string())
            .collect();

        if column_names.is_empty() {
            let rows_affected = result.affected_rows();
            // Drain so the connection is ready for the next statement
            result
                .drop_result()
                .await
                .map_err(|e| DbReachError::query_failed(format!("Failed to finish statement: {e}")))?;

            return Ok(QueryResult { columns: Vec::new(), rows: Vec::new(), rows_affected: Some(rows_affected) });
        }

        let rows: Vec<Row> = result
            .collect()
            .await
            .map_err(|e| DbReachError::query_failed(format!("Failed to read rows: {e}")))?;

        let rows = rows.iter().map(row_to_json).collect::<Result<Vec<_>>>()?;

        Ok(QueryResult { columns: column_names, rows, rows_affected: None })
    }

    async fn ping(&mut self) -> Result<()> {
        self.conn
            .query_drop(DatabaseType::MySQL.liveness_query())
            .await
            .map_err(|e| DbReachError::stale_connection(format!("MySQL liveness query failed: {e}")))
    }

    async fn begin(&mut self) -> Result<()> {
        if self.in_transaction {
            return Ok(());
        }
        self.conn
            .query_drop("START TRANSACTION")
            .await
            .map_err(|e| DbReachError::query_failed(format!("Failed to begin transaction: {e}")))?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        self.conn
            .query_drop("COMMIT")
            .await
            .map_err(|e| DbReachError::query_failed(format!("Failed to commit: {e}")))
    }

    async fn close(self) -> Result<()> {
        self.conn
            .disconnect()
            .await
            .map_err(|e| DbReachError::query_failed(format!("Failed to disconnect: {e}")))
    }
}

/// Build `MySQL` connection options from `ConnectionConfig`
fn build_mysql_opts(config: &ConnectionConfig) -> OptsBuilder {
    let opts = OptsBuilder::default()
        .ip_or_hostname(config.host.clone())
        .tcp_port(config.port)
        .user(Some(config.user.clone()))
        .pass(Some(config.password.clone()))
        .db_name(config.database.clone());

    if config.encrypt {
        let skip_validation = !config.ssl_validate_certificate;
        opts.ssl_opts(Some(
            SslOpts::default()
                .with_danger_accept_invalid_certs(skip_validation)
                .with_danger_skip_domain_validation(skip_validation),
        ))
    } else {
        opts.ssl_opts(None::<SslOpts>)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_mysql_value(param: &SqlParam) -> Value {
    match param {
        SqlParam::Null => Value::NULL,
        SqlParam::Bool(v) => Value::Int(i64::from(*v)),
        SqlParam::Int(v) => Value::Int(*v),
        SqlParam::Float(v) => Value::Double(*v),
        SqlParam::Text(v) => Value::Bytes(v.as_bytes().to_vec()),
        SqlParam::Bytes(v) => Value::Bytes(v.clone()),
        SqlParam::Timestamp(v) => Value::Date(
            v.year() as u16,
            v.month() as u8,
            v.day() as u8,
            v.hour() as u8,
            v.minute() as u8,
            v.second() as u8,
            v.and_utc().timestamp_subsec_micros(),
        ),
    }
}

/// Convert a `MySQL` row to a JSON-safe `Vec` in column order
fn row_to_json(row: &Row) -> Result<Vec<serde_json::Value>> {
    (0..row.len()).map(|idx| mysql_value_to_json(row, idx)).collect()
}

/// Convert `MySQL` value to JSON value
fn mysql_value_to_json(row: &Row, idx: usize) -> Result<serde_json::Value> {
    let value = row
        .as_ref(idx)
        .ok_or_else(|| DbReachError::query_failed(format!("Failed to get value at index {idx}")))?;

    let json_value = match value {
        Value::NULL => serde_json::Value::Null,

        Value::Bytes(bytes) => {
            if let Ok(s) = std::str::from_utf8(bytes) {
                serde_json::Value::String(s.to_string())
            } else {
                use base64::Engine;
                serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
            }
        }

        Value::Int(i) => serde_json::Value::Number((*i).into()),

        Value::UInt(u) => serde_json::json!(*u),

        Value::Float(f) => serde_json::Number::from_f64(f64::from(*f))
            .map_or(serde_json::Value::Null, serde_json::Value::Number),

        Value::Double(d) => {
            serde_json::Number::from_f64(*d).map_or(serde_json::Value::Null, serde_json::Value::Number)
        }

        Value::Date(year, month, day, hour, minute, second, micro) => serde_json::Value::String(format!(
            "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{micro:06}"
        )),

        Value::Time(is_negative, days, hours, minutes, seconds, micros) => {
            let sign = if *is_negative { "-" } else { "" };
            let total_hours = days * 24 + u32::from(*hours);
            serde_json::Value::String(format!("{sign}{total_hours}:{minutes:02}:{seconds:02}.{micros:06}"))
        }
    };

    Ok(json_value)
}
