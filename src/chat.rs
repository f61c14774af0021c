//! Conversational retrieval engine.
//!
//! Turns a conversation history into a search query (reformulating
//! multi-turn histories through the LLM), retrieves the nearest chunks,
//! assembles a bounded context block, and generates an answer — buffered
//! or streamed.
//!
//! Chat calls are deliberately not retried: the caller is a waiting human,
//! and a failed request should surface immediately rather than after a
//! backoff cycle.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::ChatConfig;
use crate::embedding::EmbeddingService;
use crate::error::ServiceError;
use crate::index::VectorIndex;
use crate::llm::{ChatModel, DeltaStream, Message};
use crate::models::{ChatTurn, Role, ScoredChunk};

const REFORMULATE_INSTRUCTION: &str =
    "Given the above conversation, generate a search query to look up in order to get \
     information relevant to the conversation. Only respond with the query, nothing else.";

/// How the search query for a conversation was derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryPlan {
    /// Single-turn conversation: the user's message is the query, no LLM
    /// call involved.
    SingleTurn { query: String },
    /// Multi-turn conversation: the LLM rewrote the history into a
    /// standalone query.
    MultiTurn { query: String },
}

impl QueryPlan {
    pub fn query(&self) -> &str {
        match self {
            QueryPlan::SingleTurn { query } | QueryPlan::MultiTurn { query } => query,
        }
    }
}

/// A retrieved source reference attached to an answer.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceRef {
    pub document_id: String,
    pub title: String,
    pub score: f32,
}

/// A complete (non-streamed) answer with its sources.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<SourceRef>,
}

pub struct RetrievalEngine {
    model: Arc<dyn ChatModel>,
    embedder: Arc<dyn EmbeddingService>,
    index: Arc<dyn VectorIndex>,
    namespace: String,
    config: ChatConfig,
}

impl RetrievalEngine {
    pub fn new(
        model: Arc<dyn ChatModel>,
        embedder: Arc<dyn EmbeddingService>,
        index: Arc<dyn VectorIndex>,
        namespace: String,
        config: ChatConfig,
    ) -> Self {
        Self {
            model,
            embedder,
            index,
            namespace,
            config,
        }
    }

    /// Derive the search query from the history.
    ///
    /// A history is valid when it is non-empty and ends with a user turn.
    /// One turn skips the reformulation call entirely; anything longer goes
    /// through the LLM, and the rewritten query is used verbatim.
    pub async fn plan_query(&self, history: &[ChatTurn]) -> Result<QueryPlan, ServiceError> {
        let last = validate_history(history)?;

        if history.len() == 1 {
            return Ok(QueryPlan::SingleTurn {
                query: last.text.clone(),
            });
        }

        let mut messages: Vec<Message> = history.iter().map(turn_to_message).collect();
        messages.push(Message::user(REFORMULATE_INSTRUCTION));

        let query = self.model.complete(&messages).await?;
        let query = query.trim().to_string();
        if query.is_empty() {
            return Err(ServiceError::Service(
                "reformulation returned an empty query".into(),
            ));
        }
        if query.contains('\n') {
            warn!("reformulated query contains a newline; using it as-is");
        }
        debug!(%query, "reformulated multi-turn conversation");
        Ok(QueryPlan::MultiTurn { query })
    }

    /// Embed the query and fetch the top-K nearest chunks.
    pub async fn retrieve(&self, query: &str) -> Result<Vec<ScoredChunk>, ServiceError> {
        let vectors = self.embedder.embed(&[query.to_string()]).await?;
        let vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::Service("query embedding came back empty".into()))?;
        self.index
            .query(&self.namespace, &vector, self.config.top_k)
            .await
    }

    /// Generate a buffered answer for the conversation.
    pub async fn answer(
        &self,
        history: &[ChatTurn],
        extra_instructions: Option<&str>,
    ) -> Result<Answer, ServiceError> {
        let plan = self.plan_query(history).await?;
        let hits = self.retrieve(plan.query()).await?;
        let messages = self.build_messages(history, &hits, extra_instructions);
        let text = self.model.complete(&messages).await?;
        Ok(Answer {
            text,
            sources: sources_from(&hits),
        })
    }

    /// Generate a streaming answer. Dropping the returned stream cancels
    /// the upstream completion.
    pub async fn answer_stream(
        &self,
        history: &[ChatTurn],
        extra_instructions: Option<&str>,
    ) -> Result<(DeltaStream, Vec<SourceRef>), ServiceError> {
        let plan = self.plan_query(history).await?;
        let hits = self.retrieve(plan.query()).await?;
        let messages = self.build_messages(history, &hits, extra_instructions);
        let stream = self.model.stream(&messages).await?;
        Ok((stream, sources_from(&hits)))
    }

    fn build_messages(
        &self,
        history: &[ChatTurn],
        hits: &[ScoredChunk],
        extra_instructions: Option<&str>,
    ) -> Vec<Message> {
        let context = assemble_context(hits, self.config.max_context_bytes);
        let mut system = self.config.system_prompt.clone();
        if let Some(extra) = extra_instructions.map(str::trim).filter(|s| !s.is_empty()) {
            system.push_str("\n\n");
            system.push_str(extra);
        }
        system.push_str("\n\n<context>\n");
        system.push_str(&context);
        system.push_str("\n</context>");

        let mut messages = vec![Message::system(system)];
        messages.extend(history.iter().map(turn_to_message));
        messages
    }
}

fn validate_history(history: &[ChatTurn]) -> Result<&ChatTurn, ServiceError> {
    let last = history
        .last()
        .ok_or_else(|| ServiceError::InvalidInput("conversation history is empty".into()))?;
    if last.role != Role::User {
        return Err(ServiceError::InvalidInput(
            "conversation must end with a user turn".into(),
        ));
    }
    if last.text.trim().is_empty() {
        return Err(ServiceError::InvalidInput(
            "latest user message is empty".into(),
        ));
    }
    Ok(last)
}

fn turn_to_message(turn: &ChatTurn) -> Message {
    match turn.role {
        Role::User => Message::user(turn.text.clone()),
        Role::Assistant => Message::assistant(turn.text.clone()),
    }
}

/// Join retrieved excerpts, best first, dropping whole excerpts once the
/// byte budget is reached. Never truncates mid-excerpt.
fn assemble_context(hits: &[ScoredChunk], max_bytes: usize) -> String {
    let mut context = String::new();
    for hit in hits {
        // The best excerpt is always included, even when it alone exceeds
        // the budget; later ones must fit whole.
        let addition = hit.metadata.excerpt.len() + 2;
        if !context.is_empty() {
            if context.len() + addition > max_bytes {
                break;
            }
            context.push_str("\n\n");
        }
        context.push_str(&hit.metadata.excerpt);
    }
    context
}

fn sources_from(hits: &[ScoredChunk]) -> Vec<SourceRef> {
    hits.iter()
        .map(|h| SourceRef {
            document_id: h.metadata.document_id.clone(),
            title: h.metadata.title.clone(),
            score: h.score,
        })
        .collect()
}
