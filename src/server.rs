//! HTTP surface: streaming chat, ingestion trigger, health.
//!
//! `POST /chat` answers over `text/event-stream`: one event per text
//! delta, a final `[DONE]` data event on success, and an `error` event if
//! generation fails mid-stream. Client disconnect drops the delta stream,
//! which cancels the upstream completion.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::chat::RetrievalEngine;
use crate::error::ServiceError;
use crate::ingest::{Ingestor, RunOptions};
use crate::models::ChatTurn;

pub struct AppState {
    pub engine: RetrievalEngine,
    pub ingestor: Arc<Ingestor>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/chat", post(chat))
        .route("/ingest", post(ingest))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>, bind: &str) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(%bind, "server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Error shape returned by non-streaming endpoints and chat setup failures.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let status = match err {
            ServiceError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    history: Vec<ChatTurn>,
    #[serde(default)]
    extra_instructions: Option<String>,
}

async fn chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let request_id = Uuid::new_v4();
    info!(%request_id, turns = request.history.len(), "chat request");

    // Reformulation and retrieval happen before the response starts; their
    // failures map to plain HTTP errors. Only generation streams.
    let (mut deltas, _sources) = state
        .engine
        .answer_stream(&request.history, request.extra_instructions.as_deref())
        .await?;

    let stream = async_stream::stream! {
        while let Some(item) = deltas.next().await {
            match item {
                Ok(delta) => yield Ok(Event::default().data(delta)),
                Err(e) => {
                    error!(%request_id, error = %e, "answer stream failed");
                    yield Ok(Event::default().event("error").data(e.to_string()));
                    return;
                }
            }
        }
        yield Ok(Event::default().data("[DONE]"));
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn ingest(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let request_id = Uuid::new_v4();
    info!(%request_id, "ingestion triggered over HTTP");
    let report = state
        .ingestor
        .clone()
        .run(RunOptions::default())
        .await
        .map_err(|e| ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{:#}", e),
        })?;
    Ok(Json(report).into_response())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_reports_version() {
        let Json(body) = health().await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn invalid_input_maps_to_bad_request() {
        let api: ApiError = ServiceError::InvalidInput("empty history".into()).into();
        assert_eq!(api.status, StatusCode::BAD_REQUEST);

        let api: ApiError = ServiceError::Service("upstream".into()).into();
        assert_eq!(api.status, StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn chat_request_accepts_optional_instructions() {
        let json = r#"{"history":[{"role":"user","text":"hi"}]}"#;
        let req: ChatRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.history.len(), 1);
        assert!(req.extra_instructions.is_none());
    }
}
