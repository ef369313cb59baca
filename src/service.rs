//! Operations shared by the one-shot CLI and the stdio session
//!
//! [`Service`] owns the connection cache for its lifetime, so consecutive
//! operations in a session reuse one validated connection.

use std::time::Duration;

use serde::Serialize;

use crate::assist::{describe_prompt, explain_prompt, CohereGenerator, Embedder, OllamaEmbedder, TextGenerator};
use crate::catalog::{Catalog, Product};
use crate::config::Settings;
use crate::connection::{
    discover, CacheState, ConnectionCache, DiscoveryReport, DiscoverySettings, ProbeOptions, Reachability, TcpProber,
};
use crate::diagnostics::DiagnosticsReport;
use crate::engine::{DatabaseType, Driver, EngineDriver};
use crate::error::{DbReachError, Result};

/// Per-call probe overrides
#[derive(Debug, Clone, Default)]
pub struct ProbeRequest {
    pub port: Option<u16>,
    pub tls: Option<bool>,
    pub read_banner: Option<bool>,
    pub timeout: Option<Duration>,
}

/// Outcome of `connect`
#[derive(Debug, Clone, Serialize)]
pub struct ConnectReport {
    pub endpoint: String,
    pub configured_port: u16,
    pub port: u16,
    pub server_version: String,
    pub state: CacheState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovery: Option<DiscoveryReport>,
}

/// Description lookup result
#[derive(Debug, Clone, Serialize)]
pub struct ProductDescription {
    pub name: String,
    pub description: Option<String>,
}

/// Row-count result of a write
#[derive(Debug, Clone, Serialize)]
pub struct WriteReport {
    pub name: String,
    pub rows_affected: u64,
}

/// Generated explanation, as logged to the chat log
#[derive(Debug, Clone, Serialize)]
pub struct Explanation {
    pub name: String,
    pub description: String,
    pub explanation: String,
    pub log_id: i64,
}

/// Cache slot snapshot
#[derive(Debug, Clone, Serialize)]
pub struct StateReport {
    pub state: CacheState,
    pub endpoint: String,
    pub configured_port: u16,
}

/// Result of a manual teardown
#[derive(Debug, Clone, Serialize)]
pub struct CloseReport {
    pub released: bool,
    pub state: CacheState,
}

/// Connection cache plus catalog plus optional collaborators
pub struct Service<D: Driver, R: Reachability, G, E> {
    cache: ConnectionCache<D, R>,
    catalog: Catalog,
    probe_defaults: ProbeOptions,
    generator: Option<G>,
    embedder: Option<E>,
}

/// Production wiring
pub type DefaultService = Service<EngineDriver, TcpProber, CohereGenerator, OllamaEmbedder>;

impl DefaultService {
    /// Build from resolved settings
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let catalog = Catalog::new(&settings.schema)?;
        let generator = settings.cohere.as_ref().map(CohereGenerator::new).transpose()?;
        let embedder = Some(OllamaEmbedder::new(&settings.embedding)?);
        let cache =
            ConnectionCache::new(EngineDriver, TcpProber, settings.connection, settings.discovery, settings.retry);

        Ok(Service::new(cache, catalog, settings.probe, generator, embedder))
    }
}

impl<D, R, G, E> Service<D, R, G, E>
where
    D: Driver,
    R: Reachability,
    G: TextGenerator,
    E: Embedder,
{
    pub fn new(
        cache: ConnectionCache<D, R>,
        catalog: Catalog,
        probe_defaults: ProbeOptions,
        generator: Option<G>,
        embedder: Option<E>,
    ) -> Self {
        Self { cache, catalog, probe_defaults, generator, embedder }
    }

    #[must_use]
    pub fn engine(&self) -> DatabaseType {
        self.cache.config().engine
    }

    #[must_use]
    pub fn cache(&self) -> &ConnectionCache<D, R> {
        &self.cache
    }

    /// Diagnose the configured endpoint (or another port on the same host)
    pub async fn probe(&self, request: ProbeRequest) -> DiagnosticsReport {
        let options = ProbeOptions {
            timeout: request.timeout.unwrap_or(self.probe_defaults.timeout),
            read_banner: request.read_banner.unwrap_or(self.probe_defaults.read_banner),
            tls: request.tls.unwrap_or(self.probe_defaults.tls),
            ..self.probe_defaults.clone()
        };
        let config = self.cache.config();
        let port = request.port.unwrap_or_else(|| self.cache.configured_port());

        let result = self.cache.prober().probe(&config.host, port, &options).await;
        DiagnosticsReport::from(&result)
    }

    /// Run a discovery pass without touching the cache
    pub async fn discover(&self, fallback_ports: Option<Vec<u16>>) -> DiscoveryReport {
        let configured = self.cache.discovery_settings();
        let settings = DiscoverySettings {
            enabled: true,
            fallback_ports: fallback_ports.unwrap_or_else(|| configured.fallback_ports.clone()),
            ..configured.clone()
        };
        let config = self.cache.config().with_port(self.cache.configured_port());

        discover(self.cache.driver(), self.cache.prober(), &config, &settings, self.cache.retry_policy().connect_timeout)
            .await
    }

    /// Acquire (or revalidate) the connection and report the server version
    pub async fn connect(&mut self) -> Result<ConnectReport> {
        let engine = self.engine();
        let mut cursor = self.cache.get_or_create().await?;
        cursor.execute(engine.version_query(), &[]).await?;
        let raw = cursor
            .fetch_one()
            .and_then(|row| row.into_iter().next())
            .and_then(|value| value.as_str().map(ToString::to_string))
            .unwrap_or_default();

        Ok(ConnectReport {
            endpoint: self.cache.config().target(),
            configured_port: self.cache.configured_port(),
            port: self.cache.config().port,
            server_version: engine.describe_version(&raw),
            state: self.cache.state(),
            discovery: self.cache.last_discovery().cloned(),
        })
    }

    pub async fn product_names(&mut self) -> Result<Vec<String>> {
        let mut cursor = self.cache.get_or_create().await?;
        self.catalog.product_names(&mut cursor).await
    }

    pub async fn list_products(&mut self) -> Result<Vec<Product>> {
        let mut cursor = self.cache.get_or_create().await?;
        self.catalog.list_products(&mut cursor).await
    }

    pub async fn describe_product(&mut self, name: &str) -> Result<ProductDescription> {
        let mut cursor = self.cache.get_or_create().await?;
        let description = self.catalog.description_of(&mut cursor, name).await?;
        Ok(ProductDescription { name: name.to_string(), description })
    }

    /// Insert a product; the description is generated when not given
    pub async fn add_product(&mut self, name: &str, description: Option<String>) -> Result<Product> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DbReachError::invalid_input("Product name must not be empty"));
        }

        let description = match description.filter(|d| !d.trim().is_empty()) {
            Some(description) => description,
            None => self.generator()?.generate(&describe_prompt(name)).await?,
        };
        let vector = match &self.embedder {
            Some(embedder) => Some(embedder.embed(&description).await?),
            None => None,
        };

        let mut cursor = self.cache.get_or_create().await?;
        let id = self.catalog.insert_product(&mut cursor, name, &description, vector.as_deref()).await?;
        Ok(Product { id, name: name.to_string(), description: Some(description) })
    }

    /// Replace a description and re-embed it
    pub async fn update_product(&mut self, name: &str, description: &str) -> Result<WriteReport> {
        if description.trim().is_empty() {
            return Err(DbReachError::invalid_input("New description must not be empty"));
        }
        let vector = match &self.embedder {
            Some(embedder) => Some(embedder.embed(description).await?),
            None => None,
        };

        let mut cursor = self.cache.get_or_create().await?;
        let rows_affected = self.catalog.update_description(&mut cursor, name, description, vector.as_deref()).await?;
        Ok(WriteReport { name: name.to_string(), rows_affected })
    }

    pub async fn delete_product(&mut self, name: &str) -> Result<WriteReport> {
        let mut cursor = self.cache.get_or_create().await?;
        let rows_affected = self.catalog.delete_product(&mut cursor, name).await?;
        Ok(WriteReport { name: name.to_string(), rows_affected })
    }

    /// Generate a customer-facing explanation and log it
    pub async fn explain_product(&mut self, name: &str) -> Result<Explanation> {
        let generator = self.generator.as_ref().ok_or_else(missing_generator)?;

        let mut cursor = self.cache.get_or_create().await?;
        let description = self
            .catalog
            .description_of(&mut cursor, name)
            .await?
            .ok_or_else(|| DbReachError::invalid_input(format!("No product named '{name}'")))?;

        let explanation = generator.generate(&explain_prompt(&description)).await?;
        let log_id = self.catalog.log_conversation(&mut cursor, name, &explanation, chrono::Utc::now()).await?;

        Ok(Explanation { name: name.to_string(), description, explanation, log_id })
    }

    /// Manual teardown of the cached connection
    pub async fn close(&mut self) -> CloseReport {
        let released = self.cache.close().await;
        CloseReport { released, state: self.cache.state() }
    }

    #[must_use]
    pub fn state(&self) -> StateReport {
        StateReport {
            state: self.cache.state(),
            endpoint: self.cache.config().target(),
            configured_port: self.cache.configured_port(),
        }
    }

    fn generator(&self) -> Result<&G> {
        self.generator.as_ref().ok_or_else(missing_generator)
    }
}

fn missing_generator() -> DbReachError {
    DbReachError::service_error("cohere", "no API key configured ([cohere] api_key or COHERE_API_KEY)")
}
