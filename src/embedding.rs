//! Embedding service abstraction and order-preserving batcher.
//!
//! [`EmbeddingService`] is the seam to the external embedding API; the
//! shipped implementation calls the OpenAI embeddings endpoint. The
//! [`EmbeddingBatcher`] is what ingestion actually uses: it groups chunks
//! into bounded batches, pushes every call through the shared retry
//! utility, and validates vector dimensions.
//!
//! # Partial failure
//!
//! If a batch exhausts its retries the whole embed fails, but vectors from
//! earlier batches are never rolled back — re-running ingestion is safe
//! because index writes are idempotent upserts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;
use crate::error::ServiceError;
use crate::models::Chunk;
use crate::retry::{with_backoff, RetryPolicy};

/// External embedding API: a batch of texts in, one vector per text out,
/// order preserved.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError>;
}

/// A chunk paired with its embedding vector.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// Cumulative counters for cost observability. Tracking only — correctness
/// never depends on these.
#[derive(Debug, Default)]
pub struct EmbeddingUsage {
    pub chunks: AtomicU64,
    pub bytes: AtomicU64,
    pub api_calls: AtomicU64,
}

impl EmbeddingUsage {
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.chunks.load(Ordering::Relaxed),
            self.bytes.load(Ordering::Relaxed),
            self.api_calls.load(Ordering::Relaxed),
        )
    }
}

/// Batches chunks through an [`EmbeddingService`] with retry and
/// dimension validation.
pub struct EmbeddingBatcher {
    service: Arc<dyn EmbeddingService>,
    dims: usize,
    batch_size: usize,
    policy: RetryPolicy,
    pub usage: EmbeddingUsage,
}

impl EmbeddingBatcher {
    pub fn new(service: Arc<dyn EmbeddingService>, config: &EmbeddingConfig) -> Self {
        Self {
            service,
            dims: config.dims,
            batch_size: config.batch_size,
            policy: RetryPolicy::new(config.max_attempts, config.backoff_base_secs),
            usage: EmbeddingUsage::default(),
        }
    }

    /// Embed chunks in document order, batches processed sequentially.
    ///
    /// Vectors whose dimension differs from the configured one are logged
    /// and dropped together with their chunk — never padded or truncated.
    /// The result therefore pairs each surviving chunk with its vector in
    /// the original order.
    pub async fn embed_chunks(&self, chunks: Vec<Chunk>) -> Result<Vec<EmbeddedChunk>, ServiceError> {
        let mut out = Vec::with_capacity(chunks.len());

        for batch in chunks.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let byte_total: u64 = texts.iter().map(|t| t.len() as u64).sum();

            let vectors = with_backoff(self.policy, "embed", |_attempt| {
                let texts = texts.clone();
                let service = Arc::clone(&self.service);
                async move { service.embed(&texts).await }
            })
            .await?;

            self.usage.api_calls.fetch_add(1, Ordering::Relaxed);
            self.usage.chunks.fetch_add(batch.len() as u64, Ordering::Relaxed);
            self.usage.bytes.fetch_add(byte_total, Ordering::Relaxed);

            if vectors.len() != batch.len() {
                return Err(ServiceError::Service(format!(
                    "embedding service returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                )));
            }

            for (chunk, vector) in batch.iter().cloned().zip(vectors) {
                if vector.len() != self.dims {
                    warn!(
                        document_id = %chunk.document_id,
                        ordinal = chunk.ordinal,
                        got = vector.len(),
                        want = self.dims,
                        "dropping vector with wrong dimension"
                    );
                    continue;
                }
                out.push(EmbeddedChunk { chunk, vector });
            }

            debug!(batch = batch.len(), total = out.len(), "embedded batch");
        }

        Ok(out)
    }
}

// ============ OpenAI implementation ============

/// Embedding provider using the OpenAI `POST /v1/embeddings` endpoint.
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAiEmbeddings {
    client: reqwest::Client,
    model: String,
    api_key: String,
    timeout: Duration,
}

impl OpenAiEmbeddings {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            model: config.model.clone(),
            api_key,
            timeout,
        })
    }
}

#[async_trait]
impl EmbeddingService for OpenAiEmbeddings {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
            "encoding_format": "float",
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::from_reqwest(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ServiceError::from_status(status, &body_text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ServiceError::Service(format!("bad embeddings response: {}", e)))?;

        parse_embeddings_response(&json)
    }
}

/// Extract `data[].embedding` arrays in input order. The API documents the
/// `index` field, so sort by it rather than trusting response order.
fn parse_embeddings_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, ServiceError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| ServiceError::Service("embeddings response missing data array".into()))?;

    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for item in data {
        let index = item.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as usize;
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| ServiceError::Service("embeddings response missing embedding".into()))?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vec));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}
