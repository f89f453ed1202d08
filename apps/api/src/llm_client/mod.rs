/// LLM Client — the single point of entry for all remote model calls in Quiver.
///
/// ARCHITECTURAL RULE: No other module may talk to the provider over HTTP.
/// Ranking and embedding code depend on the [`ModelProvider`] trait so tests can
/// substitute scripted providers.
///
/// Models are pinned here (not configurable) so cached job analyses and stored
/// embeddings never silently mix model generations.
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub mod prompts;
#[cfg(test)]
pub mod testing;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const PROVIDER: &str = "openai";
/// Chat model used for job analysis and batch scoring.
pub const CHAT_MODEL: &str = "gpt-4o-mini";
/// Embedding model used for bullet vectors.
pub const EMBEDDING_MODEL: &str = "text-embedding-3-small";
const MAX_RETRIES: u32 = 2;
const MAX_RETRY_AFTER: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Provider error taxonomy. `is_transient` drives every retry decision.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("No API credential configured (set OPENAI_API_KEY)")]
    MissingCredential,

    #[error("API credential rejected (status {status}): {message}")]
    InvalidCredential { status: u16, message: String },

    #[error("Rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Provider server error (status {status}): {message}")]
    Server { status: u16, message: String },

    #[error("Request rejected by provider (status {status}): {message}")]
    BadRequest { status: u16, message: String },

    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("LLM returned empty content")]
    EmptyContent,

    #[error("Unexpected provider response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    /// Transient failures are worth retrying; the rest are surfaced immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited { .. }
                | LlmError::Server { .. }
                | LlmError::Timeout
                | LlmError::Network(_)
        )
    }

    /// Malformed model output: a second attempt may well succeed.
    pub fn is_malformed_output(&self) -> bool {
        matches!(
            self,
            LlmError::Parse(_) | LlmError::EmptyContent | LlmError::InvalidResponse(_)
        )
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Network(e.to_string())
        }
    }

    fn from_status(status: StatusCode, message: String, retry_after: Option<Duration>) -> Self {
        let code = status.as_u16();
        match code {
            401 | 403 => LlmError::InvalidCredential {
                status: code,
                message,
            },
            429 => LlmError::RateLimited { retry_after },
            500..=599 => LlmError::Server {
                status: code,
                message,
            },
            _ => LlmError::BadRequest {
                status: code,
                message,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// A chat-style completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub json_mode: bool,
}

/// Remote model provider: chat completion plus text embedding.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn provider_name(&self) -> &str;
    fn chat_model(&self) -> &str;
    fn embedding_model(&self) -> &str;

    /// Returns the provider-assigned text of the first choice.
    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError>;

    /// Returns one vector per input, in input order.
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, LlmError>;
}

/// Calls the provider in JSON mode and deserializes the reply.
/// The prompt must instruct the model to return valid JSON.
pub async fn complete_json<T: DeserializeOwned>(
    provider: &dyn ModelProvider,
    system: &str,
    prompt: &str,
    max_tokens: u32,
) -> Result<T, LlmError> {
    let text = provider
        .complete(CompletionRequest {
            messages: vec![ChatMessage::system(system), ChatMessage::user(prompt)],
            temperature: 0.0,
            max_tokens,
            json_mode: true,
        })
        .await?;

    if text.trim().is_empty() {
        return Err(LlmError::EmptyContent);
    }

    // Strip markdown code fences if the model wraps JSON in them
    let text = strip_json_fences(&text);

    serde_json::from_str(text).map_err(LlmError::Parse)
}

// ────────────────────────────────────────────────────────────────────────────
// Wire types (OpenAI-compatible REST API)
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatCompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Serialize)]
struct EmbeddingBody<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

// ────────────────────────────────────────────────────────────────────────────
// Client
// ────────────────────────────────────────────────────────────────────────────

/// The single HTTP model client used by all services in Quiver.
/// Wraps chat completions and embeddings with retry on transient failures.
#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    api_key: Option<String>,
    base_url: String,
}

impl LlmClient {
    pub fn new(api_key: Option<String>, base_url: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("Failed to build HTTP client"),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// POSTs `body` to `path`, retrying 429/5xx/network failures with exponential
    /// backoff (1s, 2s) or the provider's `Retry-After` hint when it is shorter.
    async fn post<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, LlmError> {
        let api_key = self.api_key.as_deref().ok_or(LlmError::MissingCredential)?;
        let url = format!("{}/{}", self.base_url, path);

        let mut last_error: Option<LlmError> = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let backoff = Duration::from_millis(1000 * (1 << (attempt - 1)));
                let delay = match &last_error {
                    Some(LlmError::RateLimited {
                        retry_after: Some(hint),
                    }) => (*hint).min(MAX_RETRY_AFTER),
                    _ => backoff,
                };
                warn!(
                    "LLM call to {} attempt {} failed, retrying after {}ms...",
                    path,
                    attempt,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }

            let response = self
                .client
                .post(&url)
                .bearer_auth(api_key)
                .json(body)
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(LlmError::from_reqwest(e));
                    continue;
                }
            };

            let status = response.status();

            if !status.is_success() {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                let body = response.text().await.unwrap_or_default();
                let message = serde_json::from_str::<ApiError>(&body)
                    .map(|e| e.error.message)
                    .unwrap_or(body);
                let error = LlmError::from_status(status, message, retry_after);
                if error.is_transient() {
                    warn!("LLM API returned {}: {}", status, error);
                    last_error = Some(error);
                    continue;
                }
                return Err(error);
            }

            return response.json::<R>().await.map_err(LlmError::from_reqwest);
        }

        Err(last_error.unwrap_or(LlmError::RateLimited { retry_after: None }))
    }
}

#[async_trait]
impl ModelProvider for LlmClient {
    fn provider_name(&self) -> &str {
        PROVIDER
    }

    fn chat_model(&self) -> &str {
        CHAT_MODEL
    }

    fn embedding_model(&self) -> &str {
        EMBEDDING_MODEL
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError> {
        let body = ChatCompletionBody {
            model: CHAT_MODEL,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: request.json_mode.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        let response: ChatCompletionResponse = self.post("chat/completions", &body).await?;

        if let Some(usage) = &response.usage {
            debug!(
                "LLM call succeeded: prompt_tokens={}, completion_tokens={}",
                usage.prompt_tokens, usage.completion_tokens
            );
        }

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(LlmError::EmptyContent)
    }

    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let body = EmbeddingBody {
            model: EMBEDDING_MODEL,
            input: inputs,
        };
        let mut response: EmbeddingResponse = self.post("embeddings", &body).await?;

        if response.data.len() != inputs.len() {
            return Err(LlmError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                inputs.len(),
                response.data.len()
            )));
        }

        response.data.sort_by_key(|d| d.index);
        Ok(response.data.into_iter().map(|d| d.embedding).collect())
    }
}

/// Strips ```json ... ``` or ``` ... ``` code fences from LLM output.
fn strip_json_fences(text: &str) -> &str {
    let text = text.trim();
    if let Some(stripped) = text.strip_prefix("```json") {
        stripped
            .trim_start()
            .strip_suffix("```")
            .map(|s| s.trim())
            .unwrap_or(stripped.trim_start())
    } else if let Some(stripped) = text.strip_prefix("```") {
        stripped
            .trim_start()
            .strip_suffix("```")
            .map(|s| s.trim())
            .unwrap_or(stripped.trim_start())
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_json_fences_with_json_tag() {
        let input = "```json\n{\"key\": \"value\"}\n```";
        assert_eq!(strip_json_fences(input), "{\"key\": \"value\"}");
    }

    #[test]
    fn test_strip_json_fences_no_fences() {
        let input = "{\"key\": \"value\"}";
        assert_eq!(strip_json_fences(input), "{\"key\": \"value\"}");
    }

    #[test]
    fn test_status_mapping_follows_taxonomy() {
        let auth = LlmError::from_status(StatusCode::UNAUTHORIZED, "bad key".into(), None);
        assert!(matches!(auth, LlmError::InvalidCredential { status: 401, .. }));
        assert!(!auth.is_transient());

        let limited = LlmError::from_status(
            StatusCode::TOO_MANY_REQUESTS,
            String::new(),
            Some(Duration::from_secs(3)),
        );
        assert!(matches!(
            limited,
            LlmError::RateLimited {
                retry_after: Some(d)
            } if d == Duration::from_secs(3)
        ));
        assert!(limited.is_transient());

        let server = LlmError::from_status(StatusCode::BAD_GATEWAY, "upstream".into(), None);
        assert!(server.is_transient());

        let bad = LlmError::from_status(StatusCode::BAD_REQUEST, "context too long".into(), None);
        assert!(matches!(bad, LlmError::BadRequest { status: 400, .. }));
        assert!(!bad.is_transient());
    }

    #[test]
    fn test_timeout_is_transient_and_parse_is_malformed() {
        assert!(LlmError::Timeout.is_transient());
        assert!(!LlmError::MissingCredential.is_transient());
        let parse = serde_json::from_str::<u32>("nope").unwrap_err();
        assert!(LlmError::Parse(parse).is_malformed_output());
    }

    #[tokio::test]
    async fn test_missing_credential_fails_without_network() {
        let client = LlmClient::new(None, DEFAULT_BASE_URL.to_string());
        let err = client.embed(&["hello".to_string()]).await.unwrap_err();
        assert!(matches!(err, LlmError::MissingCredential));
    }

    #[test]
    fn test_chat_body_sets_json_response_format() {
        let messages = vec![ChatMessage::user("hi")];
        let body = ChatCompletionBody {
            model: CHAT_MODEL,
            messages: &messages,
            temperature: 0.0,
            max_tokens: 10,
            response_format: Some(ResponseFormat {
                kind: "json_object",
            }),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["response_format"]["type"], "json_object");
        assert_eq!(json["messages"][0]["role"], "user");
    }
}
