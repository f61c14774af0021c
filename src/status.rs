//! Durable processing-record store with conditional writes.
//!
//! The [`StatusStore`] is the only cross-worker shared mutable state in the
//! ingestion pipeline. Claims use compare-and-swap transitions so two
//! workers can never process the same document concurrently; after a
//! successful claim the owning worker is the single writer of that record
//! and uses plain saves.
//!
//! The durable implementation is SQLite via sqlx (`transition` relies on
//! `rows_affected` of a status-guarded UPDATE). [`MemoryStatusStore`] backs
//! tests.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sqlx::{Row, SqlitePool};

use crate::models::{DocumentStatus, ProcessingRecord};

#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Fetch a record by file key.
    async fn get(&self, file_key: &str) -> Result<Option<ProcessingRecord>>;

    /// Insert the record only if no record exists for its file key.
    /// Returns true when this call created it.
    async fn create_if_absent(&self, record: &ProcessingRecord) -> Result<bool>;

    /// Compare-and-swap status transition: succeeds (returns true) only if
    /// the current status is one of `from`. The winning caller owns the
    /// record until it writes a terminal status.
    async fn transition(
        &self,
        file_key: &str,
        from: &[DocumentStatus],
        to: DocumentStatus,
    ) -> Result<bool>;

    /// Unconditional save of all mutable fields. Only the claim owner may
    /// call this.
    async fn save(&self, record: &ProcessingRecord) -> Result<()>;

    /// Look up an `Indexed` record with this content fingerprint under a
    /// different file key — a duplicate-content probe.
    async fn find_indexed_duplicate(
        &self,
        fingerprint: &str,
        excluding_file_key: &str,
    ) -> Result<Option<ProcessingRecord>>;

    /// All records, ordered by file key. Used by the status CLI.
    async fn list(&self) -> Result<Vec<ProcessingRecord>>;
}

// ============ SQLite implementation ============

pub struct SqliteStatusStore {
    pool: SqlitePool,
}

impl SqliteStatusStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> ProcessingRecord {
    let status_str: String = row.get("status");
    ProcessingRecord {
        file_key: row.get("file_key"),
        document_id: row.get("document_id"),
        fingerprint: row.get("fingerprint"),
        status: DocumentStatus::parse(&status_str).unwrap_or(DocumentStatus::Failed),
        chunk_count: row.get("chunk_count"),
        retry_count: row.get("retry_count"),
        last_error: row.get("last_error"),
        source_bytes: row.get("source_bytes"),
        created_at: Utc
            .timestamp_opt(row.get::<i64, _>("created_at"), 0)
            .single()
            .unwrap_or_else(Utc::now),
        updated_at: Utc
            .timestamp_opt(row.get::<i64, _>("updated_at"), 0)
            .single()
            .unwrap_or_else(Utc::now),
    }
}

#[async_trait]
impl StatusStore for SqliteStatusStore {
    async fn get(&self, file_key: &str) -> Result<Option<ProcessingRecord>> {
        let row = sqlx::query("SELECT * FROM processing_records WHERE file_key = ?")
            .bind(file_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_record))
    }

    async fn create_if_absent(&self, record: &ProcessingRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO processing_records
                (file_key, document_id, fingerprint, status, chunk_count,
                 retry_count, last_error, source_bytes, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(file_key) DO NOTHING
            "#,
        )
        .bind(&record.file_key)
        .bind(&record.document_id)
        .bind(&record.fingerprint)
        .bind(record.status.as_str())
        .bind(record.chunk_count)
        .bind(record.retry_count)
        .bind(&record.last_error)
        .bind(record.source_bytes)
        .bind(record.created_at.timestamp())
        .bind(record.updated_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn transition(
        &self,
        file_key: &str,
        from: &[DocumentStatus],
        to: DocumentStatus,
    ) -> Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }
        // sqlx sqlite has no array binds; the status set is small and fixed.
        let placeholders = vec!["?"; from.len()].join(", ");
        let sql = format!(
            "UPDATE processing_records SET status = ?, updated_at = ? \
             WHERE file_key = ? AND status IN ({})",
            placeholders
        );
        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(Utc::now().timestamp())
            .bind(file_key);
        for status in from {
            query = query.bind(status.as_str());
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn save(&self, record: &ProcessingRecord) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE processing_records SET
                document_id = ?, fingerprint = ?, status = ?, chunk_count = ?,
                retry_count = ?, last_error = ?, source_bytes = ?, updated_at = ?
            WHERE file_key = ?
            "#,
        )
        .bind(&record.document_id)
        .bind(&record.fingerprint)
        .bind(record.status.as_str())
        .bind(record.chunk_count)
        .bind(record.retry_count)
        .bind(&record.last_error)
        .bind(record.source_bytes)
        .bind(Utc::now().timestamp())
        .bind(&record.file_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_indexed_duplicate(
        &self,
        fingerprint: &str,
        excluding_file_key: &str,
    ) -> Result<Option<ProcessingRecord>> {
        let row = sqlx::query(
            "SELECT * FROM processing_records \
             WHERE fingerprint = ? AND file_key != ? AND status = 'indexed' LIMIT 1",
        )
        .bind(fingerprint)
        .bind(excluding_file_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_record))
    }

    async fn list(&self) -> Result<Vec<ProcessingRecord>> {
        let rows = sqlx::query("SELECT * FROM processing_records ORDER BY file_key")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_record).collect())
    }
}

// ============ In-memory implementation ============

/// In-memory status store for tests. The mutex makes every operation
/// atomic, which is exactly the conditional-write guarantee the trait asks
/// for.
#[derive(Default)]
pub struct MemoryStatusStore {
    records: Mutex<HashMap<String, ProcessingRecord>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn get(&self, file_key: &str) -> Result<Option<ProcessingRecord>> {
        Ok(self.records.lock().unwrap().get(file_key).cloned())
    }

    async fn create_if_absent(&self, record: &ProcessingRecord) -> Result<bool> {
        let mut records = self.records.lock().unwrap();
        if records.contains_key(&record.file_key) {
            return Ok(false);
        }
        records.insert(record.file_key.clone(), record.clone());
        Ok(true)
    }

    async fn transition(
        &self,
        file_key: &str,
        from: &[DocumentStatus],
        to: DocumentStatus,
    ) -> Result<bool> {
        let mut records = self.records.lock().unwrap();
        match records.get_mut(file_key) {
            Some(rec) if from.contains(&rec.status) => {
                rec.status = to;
                rec.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn save(&self, record: &ProcessingRecord) -> Result<()> {
        let mut rec = record.clone();
        rec.updated_at = Utc::now();
        self.records
            .lock()
            .unwrap()
            .insert(record.file_key.clone(), rec);
        Ok(())
    }

    async fn find_indexed_duplicate(
        &self,
        fingerprint: &str,
        excluding_file_key: &str,
    ) -> Result<Option<ProcessingRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .find(|r| {
                r.fingerprint == fingerprint
                    && r.file_key != excluding_file_key
                    && r.status == DocumentStatus::Indexed
            })
            .cloned())
    }

    async fn list(&self) -> Result<Vec<ProcessingRecord>> {
        let mut records: Vec<_> = self.records.lock().unwrap().values().cloned().collect();
        records.sort_by(|a, b| a.file_key.cmp(&b.file_key));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_if_absent_is_exclusive() {
        let store = MemoryStatusStore::new();
        let rec = ProcessingRecord::discovered("a.txt");
        assert!(store.create_if_absent(&rec).await.unwrap());
        assert!(!store.create_if_absent(&rec).await.unwrap());
    }

    #[tokio::test]
    async fn transition_is_conditional() {
        let store = MemoryStatusStore::new();
        let rec = ProcessingRecord::discovered("a.txt");
        store.create_if_absent(&rec).await.unwrap();

        // First claim wins.
        assert!(store
            .transition(
                "a.txt",
                &[DocumentStatus::Discovered, DocumentStatus::Failed],
                DocumentStatus::Extracting,
            )
            .await
            .unwrap());

        // Second claim sees Extracting and loses.
        assert!(!store
            .transition(
                "a.txt",
                &[DocumentStatus::Discovered, DocumentStatus::Failed],
                DocumentStatus::Extracting,
            )
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn transition_on_missing_key_fails() {
        let store = MemoryStatusStore::new();
        assert!(!store
            .transition("ghost.txt", &[DocumentStatus::Discovered], DocumentStatus::Extracting)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn duplicate_probe_matches_only_indexed_other_keys() {
        let store = MemoryStatusStore::new();

        let mut a = ProcessingRecord::discovered("a.txt");
        a.fingerprint = "fp1".to_string();
        a.status = DocumentStatus::Indexed;
        store.save(&a).await.unwrap();

        let mut b = ProcessingRecord::discovered("b.txt");
        b.fingerprint = "fp1".to_string();
        store.save(&b).await.unwrap();

        let hit = store.find_indexed_duplicate("fp1", "b.txt").await.unwrap();
        assert_eq!(hit.unwrap().file_key, "a.txt");

        // Same key is excluded; non-indexed records don't count.
        assert!(store
            .find_indexed_duplicate("fp1", "a.txt")
            .await
            .unwrap()
            .is_none());
    }
}
