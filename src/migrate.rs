use anyhow::Result;
use sqlx::SqlitePool;

/// Create the processing-record schema. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processing_records (
            file_key TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            fingerprint TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL,
            chunk_count INTEGER NOT NULL DEFAULT 0,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            source_bytes INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Fingerprint lookups back the duplicate-content dedup probe.
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_processing_records_fingerprint \
         ON processing_records(fingerprint)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_processing_records_status \
         ON processing_records(status)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
