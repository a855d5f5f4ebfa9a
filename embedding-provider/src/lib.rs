//! Embedding generation providers.
//!
//! The retrieval engine consumes embeddings through the [`Embedder`] trait;
//! failures are ordinary error values so ingestion loops can skip a bad item
//! and continue. The reference implementation talks JSON over HTTP to a
//! local model server.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Identifies the backing implementation that powers an embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Http,
    Hash,
}

/// Static metadata describing a particular embedder instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedderInfo {
    pub provider: ProviderKind,
    pub embedding_model_id: String,
    pub dimension: usize,
}

/// Errors produced by embedder operations. Always returned as values, never
/// panics, so batch pipelines can skip-and-continue.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("invalid embedder configuration: {message}")]
    InvalidConfiguration { message: String },
    #[error("embedding server returned HTTP {status}")]
    Http { status: u16 },
    #[error("embedding request failed: {0}")]
    Network(String),
    #[error("malformed embedding response: {0}")]
    MalformedResponse(String),
}

/// Core interface for all embedder implementations.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    fn info(&self) -> &EmbedderInfo;

    /// Embed several texts, reporting `(done, total)` after each item.
    /// Failures are captured per item so callers can keep going.
    async fn embed_batch(
        &self,
        texts: &[&str],
        mut progress: Option<&mut (dyn FnMut(usize, usize) + Send)>,
    ) -> Vec<Result<Vec<f32>, ProviderError>> {
        let mut out = Vec::with_capacity(texts.len());
        for (done, text) in texts.iter().enumerate() {
            out.push(self.embed(text).await);
            if let Some(cb) = progress.as_mut() {
                cb(done + 1, texts.len());
            }
        }
        out
    }
}

/// Configuration for the HTTP reference embedder.
#[derive(Debug, Clone)]
pub struct HttpEmbedderConfig {
    /// Full URL of the embed endpoint, e.g. `http://127.0.0.1:11434/api/embed`.
    pub endpoint: String,
    pub model: String,
    pub auth_token: Option<String>,
    pub dimension: usize,
    pub timeout_secs: u64,
    pub retry_attempts: u32,
}

impl Default for HttpEmbedderConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:11434/api/embed".into(),
            model: "nomic-embed-text".into(),
            auth_token: None,
            dimension: 768,
            timeout_secs: 30,
            retry_attempts: 3,
        }
    }
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

/// Embedder backed by a local model server speaking JSON over HTTP.
/// Retries transport and 5xx failures with exponential backoff.
#[derive(Debug)]
pub struct HttpEmbedder {
    info: EmbedderInfo,
    config: HttpEmbedderConfig,
    agent: ureq::Agent,
}

impl HttpEmbedder {
    pub fn new(config: HttpEmbedderConfig) -> Result<Self, ProviderError> {
        if config.dimension == 0 {
            return Err(ProviderError::InvalidConfiguration {
                message: "dimension must be greater than zero".into(),
            });
        }
        if config.endpoint.trim().is_empty() {
            return Err(ProviderError::InvalidConfiguration {
                message: "endpoint must not be empty".into(),
            });
        }

        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.timeout_secs.max(1))))
            .build()
            .into();

        let info = EmbedderInfo {
            provider: ProviderKind::Http,
            embedding_model_id: config.model.clone(),
            dimension: config.dimension,
        };
        Ok(Self {
            info,
            config,
            agent,
        })
    }

    fn request_once(&self, body: &str) -> Result<String, ureq::Error> {
        let mut req = self
            .agent
            .post(&self.config.endpoint)
            .header("Content-Type", "application/json");
        if let Some(token) = &self.config.auth_token {
            let auth = format!("Bearer {token}");
            req = req.header("Authorization", auth.as_str());
        }
        req.send(body)
            .and_then(|mut resp| resp.body_mut().read_to_string())
    }

    fn request_with_retry(&self, body: &str) -> Result<String, ProviderError> {
        let attempts = self.config.retry_attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            debug!(attempt, attempts, "embedding request");
            match self.request_once(body) {
                Ok(text) => return Ok(text),
                Err(ureq::Error::StatusCode(status)) => {
                    if status < 500 {
                        return Err(ProviderError::Http { status });
                    }
                    warn!(status, attempt, "embedding server error, retrying");
                    last_err = Some(ProviderError::Http { status });
                }
                Err(
                    err @ (ureq::Error::ConnectionFailed
                    | ureq::Error::HostNotFound
                    | ureq::Error::Timeout(_)
                    | ureq::Error::Io(_)),
                ) => {
                    warn!(error = %err, attempt, "embedding transport error, retrying");
                    last_err = Some(ProviderError::Network(err.to_string()));
                }
                Err(err) => return Err(ProviderError::Network(err.to_string())),
            }
            if attempt < attempts {
                std::thread::sleep(Duration::from_millis(2u64.pow(attempt - 1) * 250));
            }
        }
        Err(last_err.unwrap_or_else(|| ProviderError::Network("request failed".into())))
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let request = EmbedRequest {
            model: &self.config.model,
            prompt: text,
        };
        let body = serde_json::to_string(&request)
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        let response_text = self.request_with_retry(&body)?;
        let response: EmbedResponse = serde_json::from_str(&response_text)
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        if response.embedding.len() != self.info.dimension {
            return Err(ProviderError::MalformedResponse(format!(
                "expected {} dimensions, got {}",
                self.info.dimension,
                response.embedding.len()
            )));
        }
        Ok(response.embedding)
    }

    fn info(&self) -> &EmbedderInfo {
        &self.info
    }
}

/// Deterministic embedder for tests and offline development: the vector is
/// derived from a hash of the input text, so identical text always embeds to
/// the identical vector and distinct texts rarely collide.
pub struct HashEmbedder {
    info: EmbedderInfo,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            info: EmbedderInfo {
                provider: ProviderKind::Hash,
                embedding_model_id: "hash-embedder".into(),
                dimension,
            },
        }
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        let mut state = hasher.finish() | 1;
        (0..self.info.dimension)
            .map(|_| {
                // xorshift; map into [-1, 1]
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state as f64 / u64::MAX as f64) as f32 * 2.0 - 1.0
            })
            .collect()
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(self.vector_for(text))
    }

    fn info(&self) -> &EmbedderInfo {
        &self.info
    }
}

/// Embedder that always fails; used to exercise fail-open paths.
pub struct FailingEmbedder {
    info: EmbedderInfo,
}

impl FailingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            info: EmbedderInfo {
                provider: ProviderKind::Hash,
                embedding_model_id: "failing-embedder".into(),
                dimension,
            },
        }
    }
}

#[async_trait]
impl Embedder for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
        Err(ProviderError::Network("embedding provider offline".into()))
    }

    fn info(&self) -> &EmbedderInfo {
        &self.info
    }
}
