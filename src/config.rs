use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Object storage layout: documents arrive under `incoming_prefix` and are
/// moved under `completed_prefix` after a confirmed index write.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub root: PathBuf,
    #[serde(default = "default_incoming_prefix")]
    pub incoming_prefix: String,
    #[serde(default = "default_completed_prefix")]
    pub completed_prefix: String,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
}

fn default_incoming_prefix() -> String {
    "incoming/".to_string()
}
fn default_completed_prefix() -> String {
    "completed/".to_string()
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*.txt".to_string(), "**/*.md".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Target chunk size in bytes. A single sentence longer than this is
    /// emitted whole rather than truncated.
    pub target_bytes: usize,
    #[serde(default)]
    pub overlap_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    /// Maximum texts per embedding API call.
    #[serde(default = "default_embed_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            dims: default_dims(),
            batch_size: default_embed_batch_size(),
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_dims() -> usize {
    1536
}
fn default_embed_batch_size() -> usize {
    50
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_secs() -> u64 {
    2
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Pinecone index host, e.g. `my-index-abc123.svc.region.pinecone.io`.
    #[serde(default)]
    pub host: String,
    /// Logical partition isolating this corpus within the index.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Maximum vectors per upsert call.
    #[serde(default = "default_upsert_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    /// Fixed pause between upsert batches; simple rate limiting, not adaptive.
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            namespace: default_namespace(),
            batch_size: default_upsert_batch_size(),
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            batch_delay_ms: default_batch_delay_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_namespace() -> String {
    "lorebase".to_string()
}
fn default_upsert_batch_size() -> usize {
    100
}
fn default_batch_delay_ms() -> u64 {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_chat_model")]
    pub model: String,
    /// How many chunks a similarity search retrieves.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Byte cap on the assembled context block.
    #[serde(default = "default_max_context_bytes")]
    pub max_context_bytes: usize,
    #[serde(default = "default_chat_timeout_secs")]
    pub timeout_secs: u64,
    /// Static instructions prepended to every answer-generation prompt.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: default_chat_model(),
            top_k: default_top_k(),
            max_context_bytes: default_max_context_bytes(),
            timeout_secs: default_chat_timeout_secs(),
            system_prompt: default_system_prompt(),
        }
    }
}

fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_top_k() -> usize {
    4
}
fn default_max_context_bytes() -> usize {
    12_000
}
fn default_chat_timeout_secs() -> u64 {
    120
}
fn default_system_prompt() -> String {
    "You are a helpful reading assistant. Answer the user's questions based on the \
     provided context. If the context does not contain the answer, say so."
        .to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Documents processed concurrently. Within one document, embedding and
    /// upsert batches stay sequential to preserve ordering.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

fn default_workers() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.target_bytes == 0 {
        anyhow::bail!("chunking.target_bytes must be > 0");
    }
    if config.chunking.overlap_bytes >= config.chunking.target_bytes {
        anyhow::bail!("chunking.overlap_bytes must be smaller than chunking.target_bytes");
    }
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 || config.index.batch_size == 0 {
        anyhow::bail!("batch sizes must be > 0");
    }
    if config.embedding.max_attempts == 0 || config.index.max_attempts == 0 {
        anyhow::bail!("max_attempts must be >= 1");
    }
    if config.chat.top_k == 0 {
        anyhow::bail!("chat.top_k must be >= 1");
    }
    if config.ingest.workers == 0 {
        anyhow::bail!("ingest.workers must be >= 1");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let f = write_config(
            r#"
[db]
path = "/tmp/lore.sqlite"

[storage]
root = "/tmp/books"

[chunking]
target_bytes = 500

[server]
bind = "127.0.0.1:7410"
"#,
        );
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.embedding.dims, 1536);
        assert_eq!(cfg.embedding.batch_size, 50);
        assert_eq!(cfg.index.batch_size, 100);
        assert_eq!(cfg.chat.top_k, 4);
        assert_eq!(cfg.storage.incoming_prefix, "incoming/");
        assert_eq!(cfg.storage.completed_prefix, "completed/");
        assert_eq!(cfg.ingest.workers, 4);
    }

    #[test]
    fn zero_target_bytes_rejected() {
        let f = write_config(
            r#"
[db]
path = "/tmp/lore.sqlite"

[storage]
root = "/tmp/books"

[chunking]
target_bytes = 0

[server]
bind = "127.0.0.1:7410"
"#,
        );
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn overlap_must_be_below_target() {
        let f = write_config(
            r#"
[db]
path = "/tmp/lore.sqlite"

[storage]
root = "/tmp/books"

[chunking]
target_bytes = 100
overlap_bytes = 100

[server]
bind = "127.0.0.1:7410"
"#,
        );
        assert!(load_config(f.path()).is_err());
    }
}
