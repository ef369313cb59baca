//! Configuration Management
//!
//! Connection settings are layered, first present value wins per key:
//! 1. Secrets file (TOML)
//! 2. Process environment (`DBREACH_*`, `COHERE_API_KEY`)
//! 3. Interactive prompts (only with `--interactive`, never persisted)
//!
//! # Secrets File Locations
//! - Explicit: `--secrets <path>` (used alone when given)
//! - Local: `.dbreach/secrets.toml` (per-project)
//! - Global: `~/.config/dbreach/secrets.toml` (per-user)
//!
//! Without an explicit path, local keys override global keys one by one.
//!
//! # Example
//! ```toml
//! [database]
//! engine = "postgres"
//! address = "db.example.com"
//! port = 443
//! user = "DBADMIN"
//! password = "..."
//! encrypt = true
//! sslValidateCertificate = false
//!
//! [retry]
//! max_attempts = 3
//! base_backoff_ms = 1500
//! policy = "exponential"
//! liveness_timeout_secs = 5
//!
//! [cohere]
//! api_key = "..."
//! timeout_secs = 30
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::connection::{BackoffPolicy, DiscoverySettings, ProbeOptions, RetryPolicy};
use crate::engine::{ConnectionConfig, DatabaseType};
use crate::error::{DbReachError, Result};

/// Table namespace used when none is configured
pub const DEFAULT_SCHEMA: &str = "SMART_RETAIL1";
/// Port used when none is configured
pub const DEFAULT_PORT: u16 = 443;
pub const DEFAULT_COHERE_MODEL: &str = "command-r-plus";
pub const DEFAULT_EMBEDDING_URL: &str = "http://localhost:11434";
pub const DEFAULT_EMBEDDING_MODEL: &str = "all-minilm";
/// Request bound for the text-generation and embedding services
pub const DEFAULT_SERVICE_TIMEOUT_SECS: u64 = 30;

/// Parsed secrets file; every key optional so layers can be merged
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecretsFile {
    pub database: DatabaseSection,
    pub retry: RetrySection,
    pub probe: ProbeSection,
    pub cohere: CohereSection,
    pub embedding: EmbeddingSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub engine: Option<String>,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub encrypt: Option<bool>,
    #[serde(rename = "sslValidateCertificate")]
    pub ssl_validate_certificate: Option<bool>,
    pub schema: Option<String>,
    pub candidate_ports: Option<Vec<u16>>,
    pub discover_port: Option<bool>,
    pub persist_discovered_port: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: Option<u32>,
    pub base_backoff_ms: Option<u64>,
    pub policy: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub liveness_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProbeSection {
    pub timeout_secs: Option<u64>,
    pub tls: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CohereSection {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EmbeddingSection {
    pub url: Option<String>,
    pub model: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl SecretsFile {
    /// Keep own keys, fill gaps from `lower`
    #[must_use]
    pub fn overlay(self, lower: Self) -> Self {
        let (db, low_db) = (self.database, lower.database);
        Self {
            database: DatabaseSection {
                engine: db.engine.or(low_db.engine),
                address: db.address.or(low_db.address),
                port: db.port.or(low_db.port),
                user: db.user.or(low_db.user),
                password: db.password.or(low_db.password),
                database: db.database.or(low_db.database),
                encrypt: db.encrypt.or(low_db.encrypt),
                ssl_validate_certificate: db.ssl_validate_certificate.or(low_db.ssl_validate_certificate),
                schema: db.schema.or(low_db.schema),
                candidate_ports: db.candidate_ports.or(low_db.candidate_ports),
                discover_port: db.discover_port.or(low_db.discover_port),
                persist_discovered_port: db.persist_discovered_port.or(low_db.persist_discovered_port),
            },
            retry: RetrySection {
                max_attempts: self.retry.max_attempts.or(lower.retry.max_attempts),
                base_backoff_ms: self.retry.base_backoff_ms.or(lower.retry.base_backoff_ms),
                policy: self.retry.policy.or(lower.retry.policy),
                connect_timeout_secs: self.retry.connect_timeout_secs.or(lower.retry.connect_timeout_secs),
                liveness_timeout_secs: self.retry.liveness_timeout_secs.or(lower.retry.liveness_timeout_secs),
            },
            probe: ProbeSection {
                timeout_secs: self.probe.timeout_secs.or(lower.probe.timeout_secs),
                tls: self.probe.tls.or(lower.probe.tls),
            },
            cohere: CohereSection {
                api_key: self.cohere.api_key.or(lower.cohere.api_key),
                model: self.cohere.model.or(lower.cohere.model),
                timeout_secs: self.cohere.timeout_secs.or(lower.cohere.timeout_secs),
            },
            embedding: EmbeddingSection {
                url: self.embedding.url.or(lower.embedding.url),
                model: self.embedding.model.or(lower.embedding.model),
                timeout_secs: self.embedding.timeout_secs.or(lower.embedding.timeout_secs),
            },
        }
    }
}

/// Text-generation collaborator settings
#[derive(Clone)]
pub struct CohereSettings {
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
}

impl std::fmt::Debug for CohereSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CohereSettings")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Embedding collaborator settings
#[derive(Debug, Clone)]
pub struct EmbeddingSettings {
    pub url: String,
    pub model: String,
    pub timeout: Duration,
}

/// Fully resolved settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub connection: ConnectionConfig,
    pub schema: String,
    pub discovery: DiscoverySettings,
    pub retry: RetryPolicy,
    pub probe: ProbeOptions,
    /// Absent when no API key is configured
    pub cohere: Option<CohereSettings>,
    pub embedding: EmbeddingSettings,
}

/// Source of interactive answers for still-missing keys
pub trait Prompter {
    fn prompt(&self, key: &str, secret: bool) -> Result<String>;
}

/// Terminal prompts via `dialoguer`
#[derive(Debug, Default)]
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn prompt(&self, key: &str, secret: bool) -> Result<String> {
        let answer = if secret {
            dialoguer::Password::new().with_prompt(key).interact()
        } else {
            dialoguer::Input::<String>::new().with_prompt(key).interact_text()
        };
        answer.map_err(|e| DbReachError::config_error(format!("Could not read '{key}' interactively: {e}")))
    }
}

/// Get path to local secrets file (`.dbreach/secrets.toml`)
pub fn local_secrets_path() -> Result<PathBuf> {
    let current_dir = std::env::current_dir()
        .map_err(|e| DbReachError::config_error(format!("Could not determine current directory: {e}")))?;

    Ok(current_dir.join(".dbreach").join("secrets.toml"))
}

/// Get path to global secrets file (`~/.config/dbreach/secrets.toml`)
pub fn global_secrets_path() -> Result<PathBuf> {
    let config_dir =
        dirs::config_dir().ok_or_else(|| DbReachError::config_error("Could not determine user config directory"))?;

    Ok(config_dir.join("dbreach").join("secrets.toml"))
}

/// Parse one secrets file
pub fn load_secrets_file(path: &Path) -> Result<SecretsFile> {
    let contents = fs::read_to_string(path).map_err(|e| {
        DbReachError::config_error(format!("Could not read secrets file {}: {e}", path.display()))
    })?;

    toml::from_str(&contents).map_err(|e| {
        DbReachError::config_error(format!("Invalid secrets file {}: {e}", path.display()))
    })
}

fn load_if_exists(path: &Path) -> Result<SecretsFile> {
    if path.exists() {
        load_secrets_file(path)
    } else {
        Ok(SecretsFile::default())
    }
}

/// Load the secrets layer: explicit path alone, otherwise local over global
pub fn load_secrets(explicit: Option<&Path>) -> Result<SecretsFile> {
    if let Some(path) = explicit {
        return load_secrets_file(path);
    }

    let local = load_if_exists(&local_secrets_path()?)?;
    // A missing config dir only disables the global layer
    let global = match global_secrets_path() {
        Ok(path) => load_if_exists(&path)?,
        Err(_) => SecretsFile::default(),
    };

    Ok(local.overlay(global))
}

/// Environment lookup backed by the process environment
#[must_use]
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(DbReachError::config_error(format!("{key}: expected a boolean, got '{other}'"))),
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16> {
    value
        .trim()
        .parse()
        .map_err(|_| DbReachError::config_error(format!("{key}: expected a port number, got '{value}'")))
}

/// Merge secrets, environment and optional prompts into [`Settings`]
///
/// Fails with `ConfigurationMissing` when address, user or password is still
/// absent after every layer.
pub fn resolve<E>(secrets: SecretsFile, env: E, prompter: Option<&dyn Prompter>) -> Result<Settings>
where
    E: Fn(&str) -> Option<String>,
{
    let db = secrets.database;

    let engine = match db.engine.or_else(|| env("DBREACH_ENGINE")) {
        Some(name) => name.parse::<DatabaseType>()?,
        None => DatabaseType::Postgres,
    };

    let port = match db.port {
        Some(port) => port,
        None => env("DBREACH_PORT").map(|v| parse_port("DBREACH_PORT", &v)).transpose()?.unwrap_or(DEFAULT_PORT),
    };

    let encrypt = match db.encrypt {
        Some(flag) => flag,
        None => env("DBREACH_ENCRYPT").map(|v| parse_bool("DBREACH_ENCRYPT", &v)).transpose()?.unwrap_or(true),
    };

    let ssl_validate_certificate = match db.ssl_validate_certificate {
        Some(flag) => flag,
        None => env("DBREACH_SSL_VALIDATE_CERTIFICATE")
            .map(|v| parse_bool("DBREACH_SSL_VALIDATE_CERTIFICATE", &v))
            .transpose()?
            .unwrap_or(false),
    };

    let mut address = db.address.or_else(|| env("DBREACH_ADDRESS"));
    let mut user = db.user.or_else(|| env("DBREACH_USER"));
    let mut password = db.password.or_else(|| env("DBREACH_PASSWORD"));

    if let Some(prompter) = prompter {
        for (key, slot, secret) in
            [("address", &mut address, false), ("user", &mut user, false), ("password", &mut password, true)]
        {
            if slot.is_none() {
                *slot = Some(prompter.prompt(key, secret)?).filter(|v| !v.is_empty());
            }
        }
    }

    let missing: Vec<&str> = [("address", &address), ("user", &user), ("password", &password)]
        .into_iter()
        .filter(|(_, value)| value.is_none())
        .map(|(key, _)| key)
        .collect();
    let (Some(address), Some(user), Some(password)) = (address, user, password) else {
        return Err(DbReachError::configuration_missing(missing));
    };

    let mut connection = ConnectionConfig::new(engine, address, port, user, password);
    connection.database = db.database.or_else(|| env("DBREACH_DATABASE"));
    connection.encrypt = encrypt;
    connection.ssl_validate_certificate = ssl_validate_certificate;

    let schema = db.schema.or_else(|| env("DBREACH_SCHEMA")).unwrap_or_else(|| DEFAULT_SCHEMA.to_string());

    let retry_defaults = RetryPolicy::default();
    let retry = RetryPolicy {
        max_attempts: secrets.retry.max_attempts.unwrap_or(retry_defaults.max_attempts),
        base_backoff: secrets.retry.base_backoff_ms.map_or(retry_defaults.base_backoff, Duration::from_millis),
        backoff: secrets.retry.policy.as_deref().map(str::parse::<BackoffPolicy>).transpose()?.unwrap_or_default(),
        connect_timeout: secrets
            .retry
            .connect_timeout_secs
            .map_or(retry_defaults.connect_timeout, Duration::from_secs),
        liveness_timeout: secrets
            .retry
            .liveness_timeout_secs
            .map_or(retry_defaults.liveness_timeout, Duration::from_secs),
    };

    let probe_defaults = ProbeOptions::default();
    let probe = ProbeOptions {
        timeout: secrets.probe.timeout_secs.map_or(probe_defaults.timeout, Duration::from_secs),
        tls: secrets.probe.tls.unwrap_or(probe_defaults.tls),
        ..probe_defaults
    };

    let discovery = DiscoverySettings {
        enabled: db.discover_port.unwrap_or(true),
        fallback_ports: db.candidate_ports.unwrap_or_else(|| engine.fallback_ports().to_vec()),
        persist_discovered: db.persist_discovered_port.unwrap_or(false),
        probe_timeout: probe.timeout,
    };

    let cohere = secrets.cohere.api_key.or_else(|| env("COHERE_API_KEY")).map(|api_key| CohereSettings {
        api_key,
        model: secrets.cohere.model.unwrap_or_else(|| DEFAULT_COHERE_MODEL.to_string()),
        timeout: Duration::from_secs(secrets.cohere.timeout_secs.unwrap_or(DEFAULT_SERVICE_TIMEOUT_SECS)),
    });

    let embedding = EmbeddingSettings {
        url: secrets.embedding.url.unwrap_or_else(|| DEFAULT_EMBEDDING_URL.to_string()),
        model: secrets.embedding.model.unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
        timeout: Duration::from_secs(secrets.embedding.timeout_secs.unwrap_or(DEFAULT_SERVICE_TIMEOUT_SECS)),
    };

    Ok(Settings { connection, schema, discovery, retry, probe, cohere, embedding })
}
