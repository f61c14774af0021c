//! Core data models used throughout Lorebase.
//!
//! These types represent the documents, chunks, vectors, and conversation
//! turns that flow through the ingestion pipeline and the retrieval engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a document moving through the ingestion pipeline.
///
/// Transitions are monotonic within a run:
/// `Discovered → Extracting → Chunking → Embedding → Upserting → Indexed`,
/// with `Skipped` (dedup short-circuit) and `Failed` (any step) as the
/// other terminal states. An explicit reprocess resets a record back to
/// `Discovered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Discovered,
    Extracting,
    Chunking,
    Embedding,
    Upserting,
    Indexed,
    Failed,
    Skipped,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Discovered => "discovered",
            DocumentStatus::Extracting => "extracting",
            DocumentStatus::Chunking => "chunking",
            DocumentStatus::Embedding => "embedding",
            DocumentStatus::Upserting => "upserting",
            DocumentStatus::Indexed => "indexed",
            DocumentStatus::Failed => "failed",
            DocumentStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "discovered" => DocumentStatus::Discovered,
            "extracting" => DocumentStatus::Extracting,
            "chunking" => DocumentStatus::Chunking,
            "embedding" => DocumentStatus::Embedding,
            "upserting" => DocumentStatus::Upserting,
            "indexed" => DocumentStatus::Indexed,
            "failed" => DocumentStatus::Failed,
            "skipped" => DocumentStatus::Skipped,
            _ => return None,
        })
    }

    /// True for states that no running worker holds a claim on.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DocumentStatus::Indexed | DocumentStatus::Failed | DocumentStatus::Skipped
        )
    }
}

/// Durable per-document processing record, keyed by file key.
///
/// This is the only cross-worker shared mutable state in the system; the
/// [`crate::status::StatusStore`] guards claims with conditional writes so
/// exactly one worker owns a document at a time.
#[derive(Debug, Clone)]
pub struct ProcessingRecord {
    /// Object-store key of the source artifact, relative to the incoming prefix.
    pub file_key: String,
    /// Deterministic document id derived from the file key.
    pub document_id: String,
    /// SHA-256 of the source bytes; empty until first downloaded.
    pub fingerprint: String,
    pub status: DocumentStatus,
    /// Number of chunks indexed; meaningful once status is `Indexed`.
    pub chunk_count: i64,
    /// Number of failed ingestion runs for this key.
    pub retry_count: i64,
    /// Last error, prefixed with the failing step name.
    pub last_error: Option<String>,
    /// Size of the source artifact in bytes; used by the dedup sanity check.
    pub source_bytes: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessingRecord {
    /// A fresh record for a newly discovered file key.
    pub fn discovered(file_key: &str) -> Self {
        let now = Utc::now();
        Self {
            file_key: file_key.to_string(),
            document_id: document_id(file_key),
            fingerprint: String::new(),
            status: DocumentStatus::Discovered,
            chunk_count: 0,
            retry_count: 0,
            last_error: None,
            source_bytes: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Deterministic document id for a file key.
///
/// Re-ingesting the same key always produces the same id, which in turn
/// makes every vector id reproducible (see [`vector_id`]).
pub fn document_id(file_key: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(file_key.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..32].to_string()
}

/// Deterministic vector id for a (document, chunk ordinal) pair.
///
/// Because the id is a pure function of its inputs, repeated ingestion of
/// the same document upserts over the same ids instead of growing the index.
pub fn vector_id(document_id: &str, ordinal: usize) -> String {
    format!("{}-{}", document_id, ordinal)
}

/// A bounded contiguous slice of a document's text; the unit of embedding.
///
/// Chunks are never empty.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub document_id: String,
    /// 0-based position within the document.
    pub ordinal: usize,
    pub text: String,
}

impl Chunk {
    pub fn byte_len(&self) -> usize {
        self.text.len()
    }
}

/// Fixed per-vector metadata schema, validated at write time.
///
/// Deliberately not an open-ended map: the retrieval side depends on every
/// one of these fields being present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    pub document_id: String,
    pub chunk_ordinal: usize,
    pub title: String,
    /// Chunk text capped at [`EXCERPT_MAX_BYTES`]; what retrieval returns.
    pub excerpt: String,
}

/// Cap on the stored text excerpt, in bytes.
pub const EXCERPT_MAX_BYTES: usize = 3000;

impl ChunkMetadata {
    pub fn new(document_id: &str, ordinal: usize, title: &str, text: &str) -> Self {
        Self {
            document_id: document_id.to_string(),
            chunk_ordinal: ordinal,
            title: title.to_string(),
            excerpt: truncate_on_char_boundary(text, EXCERPT_MAX_BYTES).to_string(),
        }
    }

    /// Validate the schema before an index write.
    pub fn validate(&self) -> Result<(), String> {
        if self.document_id.is_empty() {
            return Err("metadata document_id must not be empty".to_string());
        }
        if self.excerpt.is_empty() {
            return Err("metadata excerpt must not be empty".to_string());
        }
        if self.excerpt.len() > EXCERPT_MAX_BYTES {
            return Err(format!(
                "metadata excerpt exceeds {} bytes",
                EXCERPT_MAX_BYTES
            ));
        }
        Ok(())
    }
}

/// Truncate to at most `max` bytes without splitting a UTF-8 character.
pub fn truncate_on_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// One (id, vector, metadata) triple destined for the index.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub values: Vec<f32>,
    pub metadata: ChunkMetadata,
}

/// A similarity-search hit returned from the vector index.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub id: String,
    pub score: f32,
    pub metadata: ChunkMetadata,
}

/// Speaker role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One turn of a conversation, oldest first in a history slice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub text: String,
}

impl ChatTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// Summary of one ingestion run, returned by the CLI and the trigger endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub scanned: usize,
    pub indexed: usize,
    pub skipped: usize,
    pub failed: usize,
}
