//! Vector index abstraction, the Pinecone client, and the batching writer.
//!
//! [`VectorIndex`] covers the two operations the system needs: idempotent
//! upsert and top-K similarity query, both namespace-scoped. The
//! [`IndexWriter`] wraps an index with batching, retry, and metadata
//! validation; ingestion goes through the writer, retrieval queries the
//! index directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::IndexConfig;
use crate::error::ServiceError;
use crate::models::{ChunkMetadata, ScoredChunk, VectorRecord};
use crate::retry::{with_backoff, RetryPolicy};

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Write vectors into the namespace. Ids that already exist are
    /// overwritten, which is what makes re-ingestion idempotent.
    async fn upsert(
        &self,
        namespace: &str,
        records: &[VectorRecord],
    ) -> Result<usize, ServiceError>;

    /// Top-K nearest neighbors of `vector` within the namespace.
    async fn query(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, ServiceError>;

    /// Delete every vector belonging to a document, regardless of how many
    /// were written or which ordinals survived. A document with no vectors
    /// is not an error.
    async fn delete_by_document(
        &self,
        namespace: &str,
        document_id: &str,
    ) -> Result<(), ServiceError>;
}

// ============ Batching writer ============

/// Pushes vectors into an index in bounded batches, each batch retried on
/// transient failure, with a fixed pause between batches.
///
/// Metadata is validated before any network call; a record with invalid
/// metadata fails the whole upsert, since shipping a vector the retrieval
/// side cannot render would be a silent data bug.
pub struct IndexWriter {
    index: Arc<dyn VectorIndex>,
    namespace: String,
    batch_size: usize,
    batch_delay: Duration,
    policy: RetryPolicy,
}

impl IndexWriter {
    pub fn new(index: Arc<dyn VectorIndex>, config: &IndexConfig) -> Self {
        Self {
            index,
            namespace: config.namespace.clone(),
            batch_size: config.batch_size,
            batch_delay: Duration::from_millis(config.batch_delay_ms),
            policy: RetryPolicy::new(config.max_attempts, config.backoff_base_secs),
        }
    }

    /// Upsert all records; returns the number written.
    pub async fn write(&self, records: &[VectorRecord]) -> Result<usize, ServiceError> {
        for record in records {
            record
                .metadata
                .validate()
                .map_err(|e| ServiceError::InvalidInput(format!("vector {}: {}", record.id, e)))?;
        }

        let mut written = 0;
        let mut batches = records.chunks(self.batch_size).peekable();
        while let Some(batch) = batches.next() {
            let count = with_backoff(self.policy, "upsert", |_attempt| {
                let index = Arc::clone(&self.index);
                let namespace = self.namespace.clone();
                async move { index.upsert(&namespace, batch).await }
            })
            .await?;
            written += count;
            debug!(batch = batch.len(), written, "upserted batch");

            if batches.peek().is_some() && !self.batch_delay.is_zero() {
                tokio::time::sleep(self.batch_delay).await;
            }
        }
        Ok(written)
    }
}

// ============ Pinecone implementation ============

/// Pinecone data-plane client. Requires the `PINECONE_API_KEY` environment
/// variable; the index host comes from config.
pub struct PineconeIndex {
    client: reqwest::Client,
    host: String,
    api_key: String,
    timeout: Duration,
}

impl PineconeIndex {
    pub fn new(config: &IndexConfig) -> anyhow::Result<Self> {
        if config.host.is_empty() {
            anyhow::bail!("index.host is not configured");
        }
        let api_key = std::env::var("PINECONE_API_KEY")
            .map_err(|_| anyhow::anyhow!("PINECONE_API_KEY environment variable not set"))?;
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            host: config.host.clone(),
            api_key,
            timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("https://{}{}", self.host, path)
    }

    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, ServiceError> {
        let response = self
            .client
            .post(self.url(path))
            .header("Api-Key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| ServiceError::from_reqwest(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ServiceError::from_status(status, &body_text));
        }
        response
            .json()
            .await
            .map_err(|e| ServiceError::Service(format!("bad index response: {}", e)))
    }
}

#[async_trait]
impl VectorIndex for PineconeIndex {
    async fn upsert(
        &self,
        namespace: &str,
        records: &[VectorRecord],
    ) -> Result<usize, ServiceError> {
        if records.is_empty() {
            return Ok(0);
        }
        let vectors: Vec<serde_json::Value> = records
            .iter()
            .map(|r| {
                serde_json::json!({
                    "id": r.id,
                    "values": r.values,
                    "metadata": r.metadata,
                })
            })
            .collect();
        let body = serde_json::json!({
            "vectors": vectors,
            "namespace": namespace,
        });
        let json = self.post_json("/vectors/upsert", &body).await?;
        let count = json
            .get("upsertedCount")
            .and_then(|c| c.as_u64())
            .unwrap_or(records.len() as u64);
        Ok(count as usize)
    }

    async fn query(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, ServiceError> {
        let body = serde_json::json!({
            "vector": vector,
            "topK": top_k,
            "namespace": namespace,
            "includeMetadata": true,
        });
        let json = self.post_json("/query", &body).await?;
        let matches = json
            .get("matches")
            .and_then(|m| m.as_array())
            .ok_or_else(|| ServiceError::Service("query response missing matches".into()))?;

        let mut hits = Vec::with_capacity(matches.len());
        for m in matches {
            let id = m
                .get("id")
                .and_then(|i| i.as_str())
                .unwrap_or_default()
                .to_string();
            let score = m.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0) as f32;
            let metadata: ChunkMetadata = match m.get("metadata") {
                Some(meta) => serde_json::from_value(meta.clone()).map_err(|e| {
                    ServiceError::Service(format!("match {} has malformed metadata: {}", id, e))
                })?,
                None => {
                    return Err(ServiceError::Service(format!(
                        "match {} is missing metadata",
                        id
                    )))
                }
            };
            hits.push(ScoredChunk {
                id,
                score,
                metadata,
            });
        }
        Ok(hits)
    }

    async fn delete_by_document(
        &self,
        namespace: &str,
        document_id: &str,
    ) -> Result<(), ServiceError> {
        let body = serde_json::json!({
            "filter": { "document_id": { "$eq": document_id } },
            "namespace": namespace,
        });
        self.post_json("/vectors/delete", &body).await?;
        Ok(())
    }
}

// ============ In-memory implementation ============

/// Index double for tests: exact cosine similarity over a hash map.
#[derive(Default)]
pub struct MemoryIndex {
    namespaces: Mutex<HashMap<String, HashMap<String, VectorRecord>>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of vectors currently stored in the namespace.
    pub async fn len(&self, namespace: &str) -> usize {
        self.namespaces
            .lock()
            .await
            .get(namespace)
            .map(|ns| ns.len())
            .unwrap_or(0)
    }

    pub async fn contains(&self, namespace: &str, id: &str) -> bool {
        self.namespaces
            .lock()
            .await
            .get(namespace)
            .is_some_and(|ns| ns.contains_key(id))
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn upsert(
        &self,
        namespace: &str,
        records: &[VectorRecord],
    ) -> Result<usize, ServiceError> {
        let mut namespaces = self.namespaces.lock().await;
        let ns = namespaces.entry(namespace.to_string()).or_default();
        for record in records {
            ns.insert(record.id.clone(), record.clone());
        }
        Ok(records.len())
    }

    async fn query(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, ServiceError> {
        let namespaces = self.namespaces.lock().await;
        let Some(ns) = namespaces.get(namespace) else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<ScoredChunk> = ns
            .values()
            .map(|r| ScoredChunk {
                id: r.id.clone(),
                score: cosine(&r.values, vector),
                metadata: r.metadata.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn delete_by_document(
        &self,
        namespace: &str,
        document_id: &str,
    ) -> Result<(), ServiceError> {
        let mut namespaces = self.namespaces.lock().await;
        if let Some(ns) = namespaces.get_mut(namespace) {
            ns.retain(|_, r| r.metadata.document_id != document_id);
        }
        Ok(())
    }
}
