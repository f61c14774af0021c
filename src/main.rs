//! # Lorebase CLI (`lore`)
//!
//! The `lore` binary drives the knowledge base: database initialization,
//! document ingestion, reprocessing, one-shot questions from the terminal,
//! processing-status inspection, and the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! lore --config ./config/lore.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `lore init` | Create the SQLite database and run schema migrations |
//! | `lore ingest` | Scan the incoming prefix and index pending documents |
//! | `lore reprocess <file-key>` | Delete a document's vectors and queue it again |
//! | `lore ask "<question>"` | Ask a one-shot question against the index |
//! | `lore status [file-key]` | Show processing records |
//! | `lore serve` | Start the HTTP server (streaming chat + ingestion trigger) |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! lore init --config ./config/lore.toml
//!
//! # Index everything under the incoming prefix
//! lore ingest --config ./config/lore.toml
//!
//! # See what a run would pick up
//! lore ingest --dry-run --config ./config/lore.toml
//!
//! # Ask with a streamed answer
//! lore ask "who commands the Pequod?" --stream --config ./config/lore.toml
//!
//! # Start the server
//! lore serve --config ./config/lore.toml
//! ```

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;

use lorebase::chat::RetrievalEngine;
use lorebase::config::{self, Config};
use lorebase::embedding::{EmbeddingBatcher, OpenAiEmbeddings};
use lorebase::extract::PlainTextExtractor;
use lorebase::index::{IndexWriter, PineconeIndex, VectorIndex};
use lorebase::ingest::{Ingestor, RunOptions};
use lorebase::llm::OpenAiChat;
use lorebase::models::ChatTurn;
use lorebase::server::{self, AppState};
use lorebase::status::SqliteStatusStore;
use lorebase::storage::FsObjectStore;
use lorebase::{db, migrate};

/// Lorebase CLI — ingest documents into a vector index and answer
/// conversational questions against them.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/lore.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "lore",
    about = "Lorebase — retrieval-augmented question answering over a document corpus",
    version,
    long_about = "Lorebase ingests documents from an object store (dedup, chunk, embed, \
    idempotent vector upsert with durable per-document status), and answers conversational \
    questions against the index with streamed, context-grounded completions."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/lore.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the processing-records table.
    /// This command is idempotent — running it multiple times is safe.
    Init,

    /// Scan the incoming prefix and index pending documents.
    ///
    /// New files get a processing record; documents in `discovered` or
    /// `failed` state are claimed and run through the pipeline. Already
    /// indexed content is skipped without any embedding calls.
    Ingest {
        /// Maximum number of documents to process this run.
        #[arg(long)]
        limit: Option<usize>,

        /// Scan and register discoveries without processing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete a document's vectors and queue it for re-ingestion.
    ///
    /// Moves the completed artifact back under the incoming prefix and
    /// resets the record to `discovered`; the next ingest run picks it up.
    Reprocess {
        /// File key of the document (relative to the incoming prefix).
        file_key: String,
    },

    /// Ask a one-shot question against the index.
    Ask {
        /// The question.
        question: String,

        /// Stream the answer token-by-token instead of waiting for it.
        #[arg(long)]
        stream: bool,
    },

    /// Show processing records.
    Status {
        /// Show only this file key (full detail).
        file_key: Option<String>,
    },

    /// Start the HTTP server.
    ///
    /// Binds to `[server].bind` and serves `POST /chat` (SSE),
    /// `POST /ingest`, and `GET /health`.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lorebase=info,lore=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { limit, dry_run } => {
            let ingestor = build_ingestor(&cfg).await?;
            let report = ingestor.run(RunOptions { limit, dry_run }).await?;
            println!(
                "scanned: {}  indexed: {}  skipped: {}  failed: {}",
                report.scanned, report.indexed, report.skipped, report.failed
            );
        }
        Commands::Reprocess { file_key } => {
            let ingestor = build_ingestor(&cfg).await?;
            ingestor.reprocess(&file_key).await?;
            println!("{} queued for re-ingestion.", file_key);
        }
        Commands::Ask { question, stream } => {
            let engine = build_engine(&cfg)?;
            let history = [ChatTurn::user(question)];
            if stream {
                let (mut deltas, sources) = engine.answer_stream(&history, None).await?;
                while let Some(delta) = deltas.next().await {
                    let delta = delta?;
                    print!("{}", delta);
                    std::io::stdout().flush()?;
                }
                println!();
                print_sources(sources.iter().map(|s| (s.title.as_str(), s.score)));
            } else {
                let answer = engine.answer(&history, None).await?;
                println!("{}", answer.text);
                print_sources(answer.sources.iter().map(|s| (s.title.as_str(), s.score)));
            }
        }
        Commands::Status { file_key } => {
            let pool = db::connect(&cfg.db.path).await?;
            let store = SqliteStatusStore::new(pool);
            run_status(&store, file_key.as_deref()).await?;
        }
        Commands::Serve => {
            let ingestor = build_ingestor(&cfg).await?;
            let engine = build_engine(&cfg)?;
            let state = Arc::new(AppState { engine, ingestor });
            server::serve(state, &cfg.server.bind).await?;
        }
    }

    Ok(())
}

/// Wire up the full ingestion stack from config. Talks to OpenAI and
/// Pinecone, so the relevant API keys must be set.
async fn build_ingestor(cfg: &Config) -> Result<Arc<Ingestor>> {
    let pool = db::connect(&cfg.db.path).await?;
    migrate::run_migrations(&pool).await?;

    let status = Arc::new(SqliteStatusStore::new(pool));
    let storage = Arc::new(FsObjectStore::new(&cfg.storage)?);
    let embedder = Arc::new(OpenAiEmbeddings::new(&cfg.embedding)?);
    let index: Arc<dyn VectorIndex> = Arc::new(PineconeIndex::new(&cfg.index)?);

    Ok(Arc::new(Ingestor::new(
        status,
        storage,
        Arc::new(PlainTextExtractor),
        Arc::new(EmbeddingBatcher::new(embedder, &cfg.embedding)),
        Arc::new(IndexWriter::new(Arc::clone(&index), &cfg.index)),
        index,
        cfg.storage.incoming_prefix.clone(),
        cfg.storage.completed_prefix.clone(),
        cfg.index.namespace.clone(),
        cfg.chunking.clone(),
        cfg.ingest.workers,
    )))
}

fn build_engine(cfg: &Config) -> Result<RetrievalEngine> {
    let model = Arc::new(OpenAiChat::new(&cfg.chat)?);
    let embedder = Arc::new(OpenAiEmbeddings::new(&cfg.embedding)?);
    let index = Arc::new(PineconeIndex::new(&cfg.index)?);
    Ok(RetrievalEngine::new(
        model,
        embedder,
        index,
        cfg.index.namespace.clone(),
        cfg.chat.clone(),
    ))
}

fn print_sources<'a>(sources: impl Iterator<Item = (&'a str, f32)>) {
    let mut seen = std::collections::HashSet::new();
    for (title, score) in sources {
        if seen.insert(title.to_string()) {
            println!("  source: {} (score {:.3})", title, score);
        }
    }
}

async fn run_status(store: &SqliteStatusStore, file_key: Option<&str>) -> Result<()> {
    use lorebase::status::StatusStore as _;

    match file_key {
        Some(key) => {
            let record = store
                .get(key)
                .await?
                .with_context(|| format!("no processing record for {}", key))?;
            println!("file key:    {}", record.file_key);
            println!("document id: {}", record.document_id);
            println!("status:      {}", record.status.as_str());
            println!("fingerprint: {}", record.fingerprint);
            println!("chunks:      {}", record.chunk_count);
            println!("retries:     {}", record.retry_count);
            println!("source size: {} bytes", record.source_bytes);
            if let Some(err) = &record.last_error {
                println!("last error:  {}", err);
            }
            println!("updated:     {}", record.updated_at.to_rfc3339());
        }
        None => {
            let records = store.list().await?;
            if records.is_empty() {
                println!("No processing records.");
                return Ok(());
            }
            println!("{:<40} {:<12} {:>7} {:>8}", "FILE KEY", "STATUS", "CHUNKS", "RETRIES");
            for r in records {
                println!(
                    "{:<40} {:<12} {:>7} {:>8}",
                    r.file_key,
                    r.status.as_str(),
                    r.chunk_count,
                    r.retry_count
                );
            }
        }
    }
    Ok(())
}
