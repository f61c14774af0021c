//! Content deduplication — the primary cost-control mechanism.
//!
//! Embedding calls are the expensive step of ingestion, so before any
//! processing the pipeline checks whether this content has already been
//! indexed. The check is cheap (a status-store read plus an object-store
//! stat) and happens at document granularity.

use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::models::{DocumentStatus, ProcessingRecord};
use crate::status::StatusStore;
use crate::storage::{object_key, ObjectStore};

/// Strong content fingerprint: hex SHA-256 of the raw bytes.
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Outcome of the pre-processing dedup check.
#[derive(Debug, PartialEq, Eq)]
pub enum DedupDecision {
    /// Already fully indexed with matching content; do not reprocess and,
    /// above all, do not call the embedding service.
    AlreadyIndexed,
    /// The same content is indexed under a different file key; mark this
    /// record `Skipped`.
    DuplicateContent { indexed_file_key: String },
    /// Not processed (or a prior run left an invalid artifact); proceed.
    Process,
}

/// Decide whether `file_key` with content `fp` needs processing.
///
/// A record that claims `Indexed` is trusted only if the sanity check
/// passes: the completed artifact must exist and its size must match the
/// recorded source size. A failed sanity check means a prior partial
/// write, so the document is treated as not-processed.
pub async fn check(
    status: &dyn StatusStore,
    storage: &dyn ObjectStore,
    completed_prefix: &str,
    file_key: &str,
    fp: &str,
) -> Result<DedupDecision> {
    if let Some(record) = status.get(file_key).await? {
        if record.status == DocumentStatus::Indexed
            && record.fingerprint == fp
            && artifact_is_valid(storage, completed_prefix, &record).await?
        {
            return Ok(DedupDecision::AlreadyIndexed);
        }
    }

    if let Some(dup) = status.find_indexed_duplicate(fp, file_key).await? {
        return Ok(DedupDecision::DuplicateContent {
            indexed_file_key: dup.file_key,
        });
    }

    Ok(DedupDecision::Process)
}

async fn artifact_is_valid(
    storage: &dyn ObjectStore,
    completed_prefix: &str,
    record: &ProcessingRecord,
) -> Result<bool> {
    let key = object_key(completed_prefix, &record.file_key);
    match storage.size(&key).await? {
        Some(size) => Ok(size > 0 && size as i64 == record.source_bytes),
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::status::MemoryStatusStore;
    use crate::storage::FsObjectStore;

    fn fs_store(root: &std::path::Path) -> FsObjectStore {
        FsObjectStore::new(&StorageConfig {
            root: root.to_path_buf(),
            incoming_prefix: "incoming/".to_string(),
            completed_prefix: "completed/".to_string(),
            include_globs: vec!["**/*".to_string()],
        })
        .unwrap()
    }

    #[test]
    fn fingerprint_is_stable_and_content_sensitive() {
        assert_eq!(fingerprint(b"abc"), fingerprint(b"abc"));
        assert_ne!(fingerprint(b"abc"), fingerprint(b"abd"));
        assert_eq!(fingerprint(b"abc").len(), 64);
    }

    #[tokio::test]
    async fn unknown_key_processes() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = fs_store(tmp.path());
        let status = MemoryStatusStore::new();
        let d = check(&status, &storage, "completed/", "a.txt", "fp").await.unwrap();
        assert_eq!(d, DedupDecision::Process);
    }

    #[tokio::test]
    async fn indexed_with_valid_artifact_short_circuits() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = fs_store(tmp.path());
        storage.put("completed/a.txt", b"12345").await.unwrap();

        let status = MemoryStatusStore::new();
        let mut rec = ProcessingRecord::discovered("a.txt");
        rec.status = DocumentStatus::Indexed;
        rec.fingerprint = "fp".to_string();
        rec.source_bytes = 5;
        status.save(&rec).await.unwrap();

        let d = check(&status, &storage, "completed/", "a.txt", "fp").await.unwrap();
        assert_eq!(d, DedupDecision::AlreadyIndexed);
    }

    #[tokio::test]
    async fn indexed_with_missing_artifact_reprocesses() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = fs_store(tmp.path());

        let status = MemoryStatusStore::new();
        let mut rec = ProcessingRecord::discovered("a.txt");
        rec.status = DocumentStatus::Indexed;
        rec.fingerprint = "fp".to_string();
        rec.source_bytes = 5;
        status.save(&rec).await.unwrap();

        let d = check(&status, &storage, "completed/", "a.txt", "fp").await.unwrap();
        assert_eq!(d, DedupDecision::Process);
    }

    #[tokio::test]
    async fn indexed_with_wrong_size_artifact_reprocesses() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = fs_store(tmp.path());
        storage.put("completed/a.txt", b"123").await.unwrap();

        let status = MemoryStatusStore::new();
        let mut rec = ProcessingRecord::discovered("a.txt");
        rec.status = DocumentStatus::Indexed;
        rec.fingerprint = "fp".to_string();
        rec.source_bytes = 5;
        status.save(&rec).await.unwrap();

        let d = check(&status, &storage, "completed/", "a.txt", "fp").await.unwrap();
        assert_eq!(d, DedupDecision::Process);
    }

    #[tokio::test]
    async fn changed_fingerprint_reprocesses() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = fs_store(tmp.path());
        storage.put("completed/a.txt", b"12345").await.unwrap();

        let status = MemoryStatusStore::new();
        let mut rec = ProcessingRecord::discovered("a.txt");
        rec.status = DocumentStatus::Indexed;
        rec.fingerprint = "old".to_string();
        rec.source_bytes = 5;
        status.save(&rec).await.unwrap();

        let d = check(&status, &storage, "completed/", "a.txt", "new").await.unwrap();
        assert_eq!(d, DedupDecision::Process);
    }

    #[tokio::test]
    async fn same_content_other_key_is_duplicate() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = fs_store(tmp.path());

        let status = MemoryStatusStore::new();
        let mut rec = ProcessingRecord::discovered("original.txt");
        rec.status = DocumentStatus::Indexed;
        rec.fingerprint = "fp".to_string();
        status.save(&rec).await.unwrap();

        let d = check(&status, &storage, "completed/", "copy.txt", "fp").await.unwrap();
        assert_eq!(
            d,
            DedupDecision::DuplicateContent {
                indexed_file_key: "original.txt".to_string()
            }
        );
    }
}
