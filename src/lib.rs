//! Lorebase: a retrieval-augmented knowledge base over a document corpus.
//!
//! Two halves:
//!
//! - **Ingestion** ([`ingest`]): scan an object store, deduplicate by
//!   content fingerprint, chunk, embed, and idempotently upsert vectors
//!   into a namespaced index, with a durable per-document status record
//!   driving recovery from partial failures.
//! - **Retrieval** ([`chat`]): turn a conversation into a search query,
//!   fetch the nearest chunks, and generate a grounded answer — buffered
//!   or streamed.
//!
//! External collaborators (embedding service, vector index, LLM, object
//! store, status store, text extraction) all sit behind traits with
//! in-process doubles for tests.

pub mod chat;
pub mod chunk;
pub mod config;
pub mod db;
pub mod dedup;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod retry;
pub mod server;
pub mod status;
pub mod storage;
