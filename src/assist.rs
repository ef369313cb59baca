//! External Collaborators
//!
//! Text generation (Cohere) and text embedding (Ollama), specified only at
//! their interface boundary: one HTTP round trip each, failures mapped to
//! [`DbReachError::ServiceError`].

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{CohereSettings, EmbeddingSettings};
use crate::error::{DbReachError, Result};

const COHERE_BASE_URL: &str = "https://api.cohere.ai";

/// Prompt plus sampling parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub text: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Customer-facing explanation of a product description
#[must_use]
pub fn explain_prompt(description: &str) -> Prompt {
    Prompt {
        text: format!("Explain the following product for a customer: {description}"),
        max_tokens: 100,
        temperature: 0.5,
    }
}

/// Short generated description for a new product name
#[must_use]
pub fn describe_prompt(name: &str) -> Prompt {
    Prompt { text: format!("Write a 10-word product description for: {name}"), max_tokens: 50, temperature: 0.7 }
}

/// Hosted text generation
pub trait TextGenerator: Send + Sync {
    fn generate(&self, prompt: &Prompt) -> impl Future<Output = Result<String>> + Send;
}

/// Text embedding model
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> impl Future<Output = Result<Vec<f32>>> + Send;
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    generations: Vec<Generation>,
}

#[derive(Deserialize)]
struct Generation {
    text: String,
}

/// Client whose requests give up after `timeout`
fn http_client(service: &str, timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| DbReachError::service_error(service, format!("could not build HTTP client: {e}")))
}

/// Cohere `/v1/generate` client
#[derive(Debug, Clone)]
pub struct CohereGenerator {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl CohereGenerator {
    pub fn new(settings: &CohereSettings) -> Result<Self> {
        Ok(Self {
            client: http_client("cohere", settings.timeout)?,
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
            base_url: COHERE_BASE_URL.to_string(),
        })
    }

    /// Point at another endpoint (proxies, tests)
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

impl TextGenerator for CohereGenerator {
    async fn generate(&self, prompt: &Prompt) -> Result<String> {
        let url = format!("{}/v1/generate", self.base_url.trim_end_matches('/'));
        debug!(model = %self.model, max_tokens = prompt.max_tokens, "requesting generation");

        let body = GenerateRequest {
            model: &self.model,
            prompt: &prompt.text,
            max_tokens: prompt.max_tokens,
            temperature: prompt.temperature,
        };
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| DbReachError::service_error("cohere", e.to_string()))?;

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| DbReachError::service_error("cohere", format!("unexpected response: {e}")))?;

        parsed
            .generations
            .into_iter()
            .next()
            .map(|g| g.text.trim().to_string())
            .ok_or_else(|| DbReachError::service_error("cohere", "response contained no generations"))
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Ollama `/api/embed` client
#[derive(Debug, Clone)]
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl OllamaEmbedder {
    pub fn new(settings: &EmbeddingSettings) -> Result<Self> {
        Ok(Self {
            client: http_client("embedding", settings.timeout)?,
            url: settings.url.clone(),
            model: settings.model.clone(),
        })
    }
}

impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embed", self.url.trim_end_matches('/'));
        debug!(model = %self.model, "requesting embedding");

        let response = self
            .client
            .post(url)
            .json(&EmbedRequest { model: &self.model, input: text })
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| DbReachError::service_error("embedding", e.to_string()))?;

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| DbReachError::service_error("embedding", format!("unexpected response: {e}")))?;

        parsed
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| DbReachError::service_error("embedding", "response contained no embeddings"))
    }
}

/// Little-endian `f32` encoding for the `VECTOR` column
#[must_use]
pub fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Inverse of [`vec_to_blob`]
pub fn blob_to_vec(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(DbReachError::invalid_input(format!(
            "Vector blob length {} is not a multiple of 4",
            blob.len()
        )));
    }
    Ok(blob.chunks_exact(4).map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])).collect())
}
