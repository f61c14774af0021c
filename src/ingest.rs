//! Ingestion orchestrator.
//!
//! Drives each discovered document through the pipeline state machine:
//!
//! ```text
//! Discovered → Extracting → Chunking → Embedding → Upserting → Indexed
//!                  ↓            ↓          ↓           ↓
//!                Failed       Failed     Failed      Failed
//! ```
//!
//! Documents are processed concurrently on a bounded worker pool, but each
//! document's own batches stay sequential. The status store's CAS claim is
//! what keeps two workers off the same key; after a claim the worker is the
//! single writer of that record.
//!
//! The source artifact is moved to the completed prefix only after the
//! index write is confirmed, and the record becomes `Indexed` only after
//! the move. Every failure records the step name and leaves the document
//! reprocessable from the top; there is no mid-pipeline resume.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::chunk::chunk_text;
use crate::config::ChunkingConfig;
use crate::dedup::{self, DedupDecision};
use crate::embedding::EmbeddingBatcher;
use crate::extract::TextExtractor;
use crate::index::{IndexWriter, VectorIndex};
use crate::models::{
    vector_id, ChunkMetadata, DocumentStatus, IngestReport, ProcessingRecord, VectorRecord,
};
use crate::status::StatusStore;
use crate::storage::{object_key, ObjectStore};

/// Terminal outcome of processing one document in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Indexed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Process at most this many documents this run.
    pub limit: Option<usize>,
    /// Scan and register discoveries without processing anything.
    pub dry_run: bool,
}

pub struct Ingestor {
    status: Arc<dyn StatusStore>,
    storage: Arc<dyn ObjectStore>,
    extractor: Arc<dyn TextExtractor>,
    batcher: Arc<EmbeddingBatcher>,
    writer: Arc<IndexWriter>,
    index: Arc<dyn VectorIndex>,
    incoming_prefix: String,
    completed_prefix: String,
    namespace: String,
    chunking: ChunkingConfig,
    workers: usize,
}

impl Ingestor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        status: Arc<dyn StatusStore>,
        storage: Arc<dyn ObjectStore>,
        extractor: Arc<dyn TextExtractor>,
        batcher: Arc<EmbeddingBatcher>,
        writer: Arc<IndexWriter>,
        index: Arc<dyn VectorIndex>,
        incoming_prefix: String,
        completed_prefix: String,
        namespace: String,
        chunking: ChunkingConfig,
        workers: usize,
    ) -> Self {
        Self {
            status,
            storage,
            extractor,
            batcher,
            writer,
            index,
            incoming_prefix,
            completed_prefix,
            namespace,
            chunking,
            workers,
        }
    }

    /// Scan the incoming prefix, register new discoveries, and process
    /// pending documents on the worker pool.
    pub async fn run(self: Arc<Self>, opts: RunOptions) -> Result<IngestReport> {
        let keys = self
            .storage
            .list(&self.incoming_prefix)
            .await
            .context("failed to scan incoming documents")?;

        let mut report = IngestReport {
            scanned: keys.len(),
            ..IngestReport::default()
        };

        for key in &keys {
            self.status
                .create_if_absent(&ProcessingRecord::discovered(key))
                .await?;
        }

        if opts.dry_run {
            info!(scanned = report.scanned, "dry run, nothing processed");
            return Ok(report);
        }

        let to_process: Vec<String> = match opts.limit {
            Some(limit) => keys.into_iter().take(limit).collect(),
            None => keys,
        };

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        for key in to_process {
            let this = Arc::clone(&self);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                this.process_one(&key).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Outcome::Indexed) => report.indexed += 1,
                Ok(Outcome::Skipped) => report.skipped += 1,
                Ok(Outcome::Failed) => report.failed += 1,
                Err(e) => {
                    error!(error = %e, "ingestion worker panicked");
                    report.failed += 1;
                }
            }
        }

        info!(
            scanned = report.scanned,
            indexed = report.indexed,
            skipped = report.skipped,
            failed = report.failed,
            "ingestion run complete"
        );
        Ok(report)
    }

    async fn process_one(&self, file_key: &str) -> Outcome {
        match self.try_process(file_key).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Could not even update the record (status store down).
                error!(file_key, error = %format!("{:#}", e), "ingestion failed out of band");
                Outcome::Failed
            }
        }
    }

    async fn try_process(&self, file_key: &str) -> Result<Outcome> {
        let incoming = object_key(&self.incoming_prefix, file_key);
        let bytes = match self.storage.get(&incoming).await {
            Ok(b) => b,
            Err(e) => {
                // Listed but unreadable. Claim it so the failure lands on
                // the record; if someone else holds it, leave it to them.
                if self.claim(file_key).await? {
                    let record = self.owned_record(file_key).await?;
                    return self.fail(record, "fetch", e).await;
                }
                warn!(file_key, "cannot read incoming object and could not claim it");
                return Ok(Outcome::Skipped);
            }
        };
        let fingerprint = dedup::fingerprint(&bytes);

        match dedup::check(
            self.status.as_ref(),
            self.storage.as_ref(),
            &self.completed_prefix,
            file_key,
            &fingerprint,
        )
        .await?
        {
            DedupDecision::AlreadyIndexed => {
                info!(file_key, "already indexed, skipping");
                return Ok(Outcome::Skipped);
            }
            DedupDecision::DuplicateContent { indexed_file_key } => {
                if self
                    .status
                    .transition(
                        file_key,
                        &[DocumentStatus::Discovered, DocumentStatus::Failed],
                        DocumentStatus::Skipped,
                    )
                    .await?
                {
                    let mut record = self.owned_record(file_key).await?;
                    record.fingerprint = fingerprint;
                    record.source_bytes = bytes.len() as i64;
                    record.status = DocumentStatus::Skipped;
                    record.last_error = Some(format!("duplicate of {}", indexed_file_key));
                    self.status.save(&record).await?;
                }
                info!(file_key, duplicate_of = %indexed_file_key, "duplicate content, skipping");
                return Ok(Outcome::Skipped);
            }
            DedupDecision::Process => {}
        }

        if !self.claim(file_key).await? {
            return Ok(Outcome::Skipped);
        }

        let mut record = self.owned_record(file_key).await?;
        record.fingerprint = fingerprint;
        record.source_bytes = bytes.len() as i64;
        self.status.save(&record).await?;

        let extracted = match self.extractor.extract(file_key, &bytes) {
            Ok(doc) => doc,
            Err(e) => return self.fail(record, "extract", e).await,
        };

        record.status = DocumentStatus::Chunking;
        self.status.save(&record).await?;
        let chunks = chunk_text(
            &record.document_id,
            &extracted.text,
            self.chunking.target_bytes,
            self.chunking.overlap_bytes,
        );
        if chunks.is_empty() {
            return self
                .fail(record, "chunk", anyhow::anyhow!("document produced no chunks"))
                .await;
        }

        record.status = DocumentStatus::Embedding;
        self.status.save(&record).await?;
        let embedded = match self.batcher.embed_chunks(chunks).await {
            Ok(e) => e,
            Err(e) => return self.fail(record, "embed", e.into()).await,
        };
        if embedded.is_empty() {
            return self
                .fail(record, "embed", anyhow::anyhow!("every vector was dropped"))
                .await;
        }

        record.status = DocumentStatus::Upserting;
        self.status.save(&record).await?;

        // A previous run may have written this document with a different
        // chunk layout (more chunks, or gaps from dropped vectors). Upserts
        // only overwrite matching ids, so clear the document's old vectors
        // first; on failure the next run redoes everything from the top.
        if record.chunk_count > 0 || record.retry_count > 0 {
            if let Err(e) = self
                .index
                .delete_by_document(&self.namespace, &record.document_id)
                .await
            {
                return self.fail(record, "upsert", e.into()).await;
            }
        }

        let vectors: Vec<VectorRecord> = embedded
            .iter()
            .map(|ec| VectorRecord {
                id: vector_id(&record.document_id, ec.chunk.ordinal),
                values: ec.vector.clone(),
                metadata: ChunkMetadata::new(
                    &record.document_id,
                    ec.chunk.ordinal,
                    &extracted.title,
                    &ec.chunk.text,
                ),
            })
            .collect();
        let written = match self.writer.write(&vectors).await {
            Ok(n) => n,
            Err(e) => return self.fail(record, "upsert", e.into()).await,
        };

        // Index write confirmed; only now touch the source artifact.
        let completed = object_key(&self.completed_prefix, file_key);
        if let Err(e) = self.storage.rename(&incoming, &completed).await {
            return self.fail(record, "finalize", e).await;
        }

        record.status = DocumentStatus::Indexed;
        record.chunk_count = written as i64;
        record.last_error = None;
        self.status.save(&record).await?;
        info!(file_key, chunks = written, "document indexed");
        Ok(Outcome::Indexed)
    }

    /// Claim the document. The normal path claims from `Discovered` or
    /// `Failed`; an `Indexed` record only reaches here when the dedup
    /// sanity check refused it (changed content or missing artifact), so
    /// reclaiming it is the recovery path.
    async fn claim(&self, file_key: &str) -> Result<bool> {
        if self
            .status
            .transition(
                file_key,
                &[DocumentStatus::Discovered, DocumentStatus::Failed],
                DocumentStatus::Extracting,
            )
            .await?
        {
            return Ok(true);
        }
        if self
            .status
            .transition(file_key, &[DocumentStatus::Indexed], DocumentStatus::Extracting)
            .await?
        {
            info!(file_key, "re-ingesting a previously indexed document");
            return Ok(true);
        }
        Ok(false)
    }

    async fn owned_record(&self, file_key: &str) -> Result<ProcessingRecord> {
        self.status
            .get(file_key)
            .await?
            .with_context(|| format!("record vanished after claim: {}", file_key))
    }

    async fn fail(
        &self,
        mut record: ProcessingRecord,
        step: &str,
        err: anyhow::Error,
    ) -> Result<Outcome> {
        warn!(file_key = %record.file_key, step, error = %format!("{:#}", err), "ingestion step failed");
        record.status = DocumentStatus::Failed;
        record.retry_count += 1;
        record.last_error = Some(format!("{}: {:#}", step, err));
        self.status.save(&record).await?;
        Ok(Outcome::Failed)
    }

    /// Delete a document's vectors and reset it for a clean re-ingestion.
    ///
    /// The completed artifact is moved back under the incoming prefix so
    /// the next run rediscovers it.
    pub async fn reprocess(&self, file_key: &str) -> Result<()> {
        let mut record = self
            .status
            .get(file_key)
            .await?
            .with_context(|| format!("no processing record for {}", file_key))?;

        // Delete by document rather than by reconstructed ids: earlier runs
        // may have left vectors beyond the last recorded chunk count.
        self.index
            .delete_by_document(&self.namespace, &record.document_id)
            .await
            .map_err(anyhow::Error::from)
            .context("failed to delete vectors")?;

        let completed = object_key(&self.completed_prefix, file_key);
        if self.storage.size(&completed).await?.is_some() {
            let incoming = object_key(&self.incoming_prefix, file_key);
            self.storage.rename(&completed, &incoming).await?;
        }

        record.status = DocumentStatus::Discovered;
        record.chunk_count = 0;
        record.last_error = None;
        self.status.save(&record).await?;
        info!(file_key, "reset for reprocessing");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkingConfig, EmbeddingConfig, IndexConfig, StorageConfig};
    use crate::embedding::EmbeddingService;
    use crate::error::ServiceError;
    use crate::extract::PlainTextExtractor;
    use crate::index::MemoryIndex;
    use crate::status::MemoryStatusStore;
    use crate::storage::FsObjectStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    const DIMS: usize = 8;

    struct FakeEmbedder {
        calls: AtomicU32,
    }

    #[async_trait]
    impl EmbeddingService for FakeEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|_| vec![0.5; DIMS]).collect())
        }
    }

    struct Harness {
        ingestor: Arc<Ingestor>,
        status: Arc<MemoryStatusStore>,
        storage: Arc<FsObjectStore>,
        index: Arc<MemoryIndex>,
        embedder: Arc<FakeEmbedder>,
        _tmp: tempfile::TempDir,
    }

    fn fs_parts() -> (Arc<MemoryStatusStore>, Arc<FsObjectStore>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let storage_cfg = StorageConfig {
            root: tmp.path().to_path_buf(),
            incoming_prefix: "incoming/".to_string(),
            completed_prefix: "completed/".to_string(),
            include_globs: vec!["**/*.txt".to_string()],
        };
        let storage = Arc::new(FsObjectStore::new(&storage_cfg).unwrap());
        (Arc::new(MemoryStatusStore::new()), storage, tmp)
    }

    fn ingestor_with(
        status: Arc<MemoryStatusStore>,
        storage: Arc<dyn ObjectStore>,
        embedder: Arc<dyn EmbeddingService>,
        index: Arc<dyn VectorIndex>,
    ) -> Arc<Ingestor> {
        let embed_cfg = EmbeddingConfig {
            dims: DIMS,
            batch_size: 2,
            backoff_base_secs: 0,
            ..EmbeddingConfig::default()
        };
        let index_cfg = IndexConfig {
            namespace: "test".to_string(),
            batch_size: 2,
            batch_delay_ms: 0,
            backoff_base_secs: 0,
            ..IndexConfig::default()
        };
        Arc::new(Ingestor::new(
            status,
            storage,
            Arc::new(PlainTextExtractor),
            Arc::new(EmbeddingBatcher::new(embedder, &embed_cfg)),
            Arc::new(IndexWriter::new(Arc::clone(&index), &index_cfg)),
            index,
            "incoming/".to_string(),
            "completed/".to_string(),
            "test".to_string(),
            ChunkingConfig {
                target_bytes: 100,
                overlap_bytes: 0,
            },
            2,
        ))
    }

    fn harness() -> Harness {
        let (status, storage, tmp) = fs_parts();
        let index = Arc::new(MemoryIndex::new());
        let embedder = Arc::new(FakeEmbedder {
            calls: AtomicU32::new(0),
        });
        let ingestor = ingestor_with(
            status.clone(),
            storage.clone(),
            embedder.clone(),
            index.clone(),
        );
        Harness {
            ingestor,
            status,
            storage,
            index,
            embedder,
            _tmp: tmp,
        }
    }

    async fn put_doc(h: &Harness, key: &str, body: &str) {
        h.storage
            .put(&object_key("incoming/", key), body.as_bytes())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn indexes_a_document_end_to_end() {
        let h = harness();
        put_doc(&h, "a.txt", "First paragraph.\n\nSecond paragraph here.").await;

        let report = h.ingestor.clone().run(RunOptions::default()).await.unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.indexed, 1);
        assert_eq!(report.failed, 0);

        let record = h.status.get("a.txt").await.unwrap().unwrap();
        assert_eq!(record.status, DocumentStatus::Indexed);
        assert!(record.chunk_count >= 1);
        assert!(record.last_error.is_none());

        // Artifact moved; vectors carry the deterministic ids.
        assert!(h.storage.size("incoming/a.txt").await.unwrap().is_none());
        assert!(h.storage.size("completed/a.txt").await.unwrap().is_some());
        assert!(
            h.index
                .contains("test", &vector_id(&record.document_id, 0))
                .await
        );
        assert_eq!(h.index.len("test").await, record.chunk_count as usize);
    }

    #[tokio::test]
    async fn second_run_skips_without_embedding_calls() {
        let h = harness();
        put_doc(&h, "a.txt", "Some stable content.").await;
        h.ingestor.clone().run(RunOptions::default()).await.unwrap();
        let calls_after_first = h.embedder.calls.load(Ordering::SeqCst);

        // Same content re-uploaded under the same key.
        put_doc(&h, "a.txt", "Some stable content.").await;
        let report = h.ingestor.clone().run(RunOptions::default()).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.indexed, 0);
        assert_eq!(h.embedder.calls.load(Ordering::SeqCst), calls_after_first);
        assert_eq!(h.index.len("test").await, 1);
    }

    #[tokio::test]
    async fn changed_content_is_reingested_over_same_ids() {
        let h = harness();
        put_doc(&h, "a.txt", "Version one.").await;
        h.ingestor.clone().run(RunOptions::default()).await.unwrap();
        assert_eq!(h.index.len("test").await, 1);

        put_doc(&h, "a.txt", "Version two, revised.").await;
        let report = h.ingestor.clone().run(RunOptions::default()).await.unwrap();
        assert_eq!(report.indexed, 1);

        let record = h.status.get("a.txt").await.unwrap().unwrap();
        assert_eq!(record.status, DocumentStatus::Indexed);
        // Upserts overwrote the same ids; no growth.
        assert_eq!(h.index.len("test").await, 1);
    }

    #[tokio::test]
    async fn duplicate_content_under_new_key_is_skipped() {
        let h = harness();
        put_doc(&h, "a.txt", "Identical content.").await;
        h.ingestor.clone().run(RunOptions::default()).await.unwrap();

        put_doc(&h, "copy.txt", "Identical content.").await;
        let report = h.ingestor.clone().run(RunOptions::default()).await.unwrap();
        assert_eq!(report.skipped, 1);

        let record = h.status.get("copy.txt").await.unwrap().unwrap();
        assert_eq!(record.status, DocumentStatus::Skipped);
        assert!(record.last_error.unwrap().contains("a.txt"));
        assert_eq!(h.index.len("test").await, 1);
    }

    #[tokio::test]
    async fn extraction_failure_records_step_name() {
        let h = harness();
        h.storage
            .put("incoming/bad.txt", &[0xff, 0xfe, 0x00])
            .await
            .unwrap();

        let report = h.ingestor.clone().run(RunOptions::default()).await.unwrap();
        assert_eq!(report.failed, 1);

        let record = h.status.get("bad.txt").await.unwrap().unwrap();
        assert_eq!(record.status, DocumentStatus::Failed);
        assert_eq!(record.retry_count, 1);
        assert!(record.last_error.unwrap().starts_with("extract:"));
        // Failed source stays in incoming for the next run.
        assert!(h.storage.size("incoming/bad.txt").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_document_is_retried_next_run() {
        let h = harness();
        h.storage
            .put("incoming/flaky.txt", &[0xff, 0xfe, 0x00])
            .await
            .unwrap();
        h.ingestor.clone().run(RunOptions::default()).await.unwrap();

        // Operator fixes the file in place.
        put_doc(&h, "flaky.txt", "Now readable.").await;
        let report = h.ingestor.clone().run(RunOptions::default()).await.unwrap();
        assert_eq!(report.indexed, 1);
        let record = h.status.get("flaky.txt").await.unwrap().unwrap();
        assert_eq!(record.status, DocumentStatus::Indexed);
        assert_eq!(record.retry_count, 1);
    }

    #[tokio::test]
    async fn dry_run_registers_without_processing() {
        let h = harness();
        put_doc(&h, "a.txt", "Content.").await;

        let report = h
            .ingestor
            .clone()
            .run(RunOptions {
                dry_run: true,
                ..RunOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.indexed, 0);

        let record = h.status.get("a.txt").await.unwrap().unwrap();
        assert_eq!(record.status, DocumentStatus::Discovered);
        assert_eq!(h.embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reprocess_deletes_vectors_and_restores_incoming() {
        let h = harness();
        put_doc(&h, "a.txt", "Reprocess me.").await;
        h.ingestor.clone().run(RunOptions::default()).await.unwrap();
        assert_eq!(h.index.len("test").await, 1);

        h.ingestor.reprocess("a.txt").await.unwrap();
        assert_eq!(h.index.len("test").await, 0);
        assert!(h.storage.size("incoming/a.txt").await.unwrap().is_some());

        let record = h.status.get("a.txt").await.unwrap().unwrap();
        assert_eq!(record.status, DocumentStatus::Discovered);
        assert_eq!(record.chunk_count, 0);

        // And the next run indexes it again.
        let report = h.ingestor.clone().run(RunOptions::default()).await.unwrap();
        assert_eq!(report.indexed, 1);
    }

    #[tokio::test]
    async fn limit_bounds_the_run() {
        let h = harness();
        put_doc(&h, "a.txt", "One.").await;
        put_doc(&h, "b.txt", "Two.").await;
        put_doc(&h, "c.txt", "Three.").await;

        let report = h
            .ingestor
            .clone()
            .run(RunOptions {
                limit: Some(2),
                ..RunOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(report.scanned, 3);
        assert_eq!(report.indexed, 2);
    }

    #[tokio::test]
    async fn shrunk_reingest_leaves_no_stale_vectors() {
        let h = harness();
        // Three ~90-byte paragraphs, three chunks at the 100-byte target.
        let big = format!(
            "{}\n\n{}\n\n{}",
            "alpha ".repeat(15).trim_end(),
            "bravo ".repeat(15).trim_end(),
            "delta ".repeat(15).trim_end()
        );
        put_doc(&h, "a.txt", &big).await;
        h.ingestor.clone().run(RunOptions::default()).await.unwrap();
        assert_eq!(h.index.len("test").await, 3);

        // The document shrinks to a single chunk under the same key.
        put_doc(&h, "a.txt", "Just one tiny paragraph now.").await;
        let report = h.ingestor.clone().run(RunOptions::default()).await.unwrap();
        assert_eq!(report.indexed, 1);

        let record = h.status.get("a.txt").await.unwrap().unwrap();
        assert_eq!(record.chunk_count, 1);
        // The old higher-ordinal vectors are gone, not just overwritten.
        assert_eq!(h.index.len("test").await, 1);
        assert!(
            h.index
                .contains("test", &vector_id(&record.document_id, 0))
                .await
        );

        h.ingestor.reprocess("a.txt").await.unwrap();
        assert_eq!(h.index.len("test").await, 0);
    }

    #[tokio::test]
    async fn reprocess_cleans_up_ordinal_gaps_from_dropped_vectors() {
        // Embedder that returns a wrong-dimension vector for marked texts,
        // so the middle chunk is dropped and ids keep a gap (doc-0, doc-2).
        struct GapEmbedder;
        #[async_trait]
        impl EmbeddingService for GapEmbedder {
            async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
                Ok(texts
                    .iter()
                    .map(|t| {
                        if t.contains("zz-gap") {
                            vec![0.5; 3]
                        } else {
                            vec![0.5; DIMS]
                        }
                    })
                    .collect())
            }
        }

        let (status, storage, _tmp) = fs_parts();
        let index = Arc::new(MemoryIndex::new());
        let ingestor = ingestor_with(
            status.clone(),
            storage.clone(),
            Arc::new(GapEmbedder),
            index.clone(),
        );

        let body = format!(
            "{}\n\n{}\n\n{}",
            "alpha ".repeat(15).trim_end(),
            format!("zz-gap {}", "bravo ".repeat(14).trim_end()),
            "delta ".repeat(15).trim_end()
        );
        storage
            .put(&object_key("incoming/", "a.txt"), body.as_bytes())
            .await
            .unwrap();
        ingestor.clone().run(RunOptions::default()).await.unwrap();

        let record = status.get("a.txt").await.unwrap().unwrap();
        assert_eq!(record.status, DocumentStatus::Indexed);
        assert_eq!(record.chunk_count, 2);
        let doc = &record.document_id;
        assert!(index.contains("test", &vector_id(doc, 0)).await);
        assert!(!index.contains("test", &vector_id(doc, 1)).await);
        assert!(index.contains("test", &vector_id(doc, 2)).await);

        // The surviving ordinal beyond the written count is removed too.
        ingestor.reprocess("a.txt").await.unwrap();
        assert_eq!(index.len("test").await, 0);
    }

    #[tokio::test]
    async fn upsert_exhaustion_keeps_committed_batches_and_fails_document() {
        struct FailFromSecondCall {
            inner: Arc<MemoryIndex>,
            calls: AtomicU32,
        }
        #[async_trait]
        impl VectorIndex for FailFromSecondCall {
            async fn upsert(
                &self,
                namespace: &str,
                records: &[VectorRecord],
            ) -> Result<usize, ServiceError> {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n > 1 {
                    return Err(ServiceError::Service("upstream 503".into()));
                }
                self.inner.upsert(namespace, records).await
            }
            async fn query(
                &self,
                namespace: &str,
                vector: &[f32],
                top_k: usize,
            ) -> Result<Vec<crate::models::ScoredChunk>, ServiceError> {
                self.inner.query(namespace, vector, top_k).await
            }
            async fn delete_by_document(
                &self,
                namespace: &str,
                document_id: &str,
            ) -> Result<(), ServiceError> {
                self.inner.delete_by_document(namespace, document_id).await
            }
        }

        let (status, storage, _tmp) = fs_parts();
        let inner = Arc::new(MemoryIndex::new());
        let index = Arc::new(FailFromSecondCall {
            inner: inner.clone(),
            calls: AtomicU32::new(0),
        });
        let ingestor = ingestor_with(
            status.clone(),
            storage.clone(),
            Arc::new(FakeEmbedder {
                calls: AtomicU32::new(0),
            }),
            index,
        );

        // Three chunks, two-batch upsert: the second batch never succeeds.
        let body = format!(
            "{}\n\n{}\n\n{}",
            "alpha ".repeat(15).trim_end(),
            "bravo ".repeat(15).trim_end(),
            "delta ".repeat(15).trim_end()
        );
        storage
            .put(&object_key("incoming/", "a.txt"), body.as_bytes())
            .await
            .unwrap();
        let report = ingestor.run(RunOptions::default()).await.unwrap();
        assert_eq!(report.failed, 1);

        let record = status.get("a.txt").await.unwrap().unwrap();
        assert_eq!(record.status, DocumentStatus::Failed);
        assert!(record.last_error.unwrap().starts_with("upsert:"));
        // The committed first batch is not rolled back, and the source
        // stays in incoming for the next run.
        assert_eq!(inner.len("test").await, 2);
        assert!(storage.size("incoming/a.txt").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unreadable_object_is_recorded_as_failed() {
        struct UnreadableStore {
            inner: Arc<FsObjectStore>,
            bad_key: String,
        }
        #[async_trait]
        impl ObjectStore for UnreadableStore {
            async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
                self.inner.list(prefix).await
            }
            async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
                if key.ends_with(&self.bad_key) {
                    anyhow::bail!("permission denied: {}", key);
                }
                self.inner.get(key).await
            }
            async fn put(&self, key: &str, bytes: &[u8]) -> anyhow::Result<()> {
                self.inner.put(key, bytes).await
            }
            async fn rename(&self, from: &str, to: &str) -> anyhow::Result<()> {
                self.inner.rename(from, to).await
            }
            async fn size(&self, key: &str) -> anyhow::Result<Option<u64>> {
                self.inner.size(key).await
            }
        }

        let (status, fs, _tmp) = fs_parts();
        fs.put("incoming/locked.txt", b"cannot touch this")
            .await
            .unwrap();
        let storage = Arc::new(UnreadableStore {
            inner: fs,
            bad_key: "locked.txt".to_string(),
        });
        let index = Arc::new(MemoryIndex::new());
        let ingestor = ingestor_with(
            status.clone(),
            storage,
            Arc::new(FakeEmbedder {
                calls: AtomicU32::new(0),
            }),
            index,
        );

        let report = ingestor.run(RunOptions::default()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 0);

        let record = status.get("locked.txt").await.unwrap().unwrap();
        assert_eq!(record.status, DocumentStatus::Failed);
        assert!(record.last_error.unwrap().starts_with("fetch:"));
    }
}
