//! Chat-completion model abstraction and the OpenAI client.
//!
//! [`ChatModel`] exposes both a buffered completion (used for query
//! reformulation, where the full string is needed before retrieval can
//! run) and a streaming one (used for answer generation). Streams yield
//! text deltas as they arrive; dropping the stream aborts the upstream
//! request.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;

use crate::config::ChatConfig;
use crate::error::ServiceError;

/// A single message in a completion request.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Message {
    pub role: &'static str,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant",
            content: content.into(),
        }
    }
}

/// Stream of text deltas from a completion.
pub type DeltaStream = BoxStream<'static, Result<String, ServiceError>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Run a completion to the end and return the full text.
    async fn complete(&self, messages: &[Message]) -> Result<String, ServiceError>;

    /// Run a completion and stream its text deltas. The first failure ends
    /// the stream; dropping the stream cancels the request.
    async fn stream(&self, messages: &[Message]) -> Result<DeltaStream, ServiceError>;
}

// ============ OpenAI implementation ============

/// Client for the OpenAI `POST /v1/chat/completions` endpoint. Requires
/// the `OPENAI_API_KEY` environment variable.
pub struct OpenAiChat {
    client: reqwest::Client,
    model: String,
    api_key: String,
    timeout: Duration,
}

impl OpenAiChat {
    pub fn new(config: &ChatConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            model: config.model.clone(),
            api_key,
            timeout,
        })
    }

    async fn send(
        &self,
        messages: &[Message],
        stream: bool,
    ) -> Result<reqwest::Response, ServiceError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": stream,
        });
        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::from_reqwest(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ServiceError::from_status(status, &body_text));
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatModel for OpenAiChat {
    async fn complete(&self, messages: &[Message]) -> Result<String, ServiceError> {
        let response = self.send(messages, false).await?;
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ServiceError::Service(format!("bad completion response: {}", e)))?;
        json.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| ServiceError::Service("completion response missing content".into()))
    }

    async fn stream(&self, messages: &[Message]) -> Result<DeltaStream, ServiceError> {
        let response = self.send(messages, true).await?;
        let timeout = self.timeout;
        let mut bytes = response.bytes_stream();

        // Server-sent events arrive as `data: {json}` lines; a chunk from
        // the transport may split an event, so buffer until a newline.
        let stream = async_stream::stream! {
            let mut buffer = String::new();
            'outer: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(ServiceError::from_reqwest(e, timeout));
                        break;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);

                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        break 'outer;
                    }
                    match parse_delta(data) {
                        Ok(Some(delta)) if !delta.is_empty() => yield Ok(delta),
                        Ok(_) => {}
                        Err(e) => {
                            yield Err(e);
                            break 'outer;
                        }
                    }
                }
            }
        };
        Ok(stream.boxed())
    }
}

fn parse_delta(data: &str) -> Result<Option<String>, ServiceError> {
    let json: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| ServiceError::Service(format!("bad stream event: {}", e)))?;
    Ok(json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_content_delta() {
        let data = r#"{"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_delta(data).unwrap(), Some("Hel".to_string()));
    }

    #[test]
    fn role_only_delta_yields_nothing() {
        let data = r#"{"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_delta(data).unwrap(), None);
    }

    #[test]
    fn malformed_event_is_an_error() {
        assert!(parse_delta("{not json").is_err());
    }
}
