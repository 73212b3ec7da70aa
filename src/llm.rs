use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::retry::{RetryError, RetryPolicy, retry_with_backoff};

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Everything needed to ask for one completion of one chunk.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub chunk: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn messages(&self) -> Vec<ChatMessage> {
        vec![
            ChatMessage { role: Role::System, content: self.prompt.clone() },
            ChatMessage { role: Role::User, content: self.chunk.clone() },
        ]
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("rate limit exceeded: {0}")]
    RateLimited(String),
    #[error("api error {status}: {body}")]
    Status { status: u16, body: String },
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to parse response: {0}")]
    Parse(String),
    #[error("response contained no choices")]
    EmptyChoices,
}

impl ApiError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ApiError::RateLimited(_))
    }
}

/// A single completion attempt. Retries live in [`complete_chunk`].
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, req: &CompletionRequest) -> Result<String, ApiError>;
}

pub struct OpenAiClient {
    http: Client,
    api_key: String,
    api_base: String,
}

impl OpenAiClient {
    pub fn new(api_key: String, api_base: Option<String>, timeout: Option<Duration>) -> anyhow::Result<Self> {
        let mut builder = Client::builder();
        if let Some(t) = timeout {
            builder = builder.timeout(t);
        }
        let http = builder.build()?;
        let api_base = api_base
            .map(|b| b.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Ok(Self { http, api_key, api_base })
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    n: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct OpenAiChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: Option<OpenAiChoiceMessage>,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[async_trait]
impl CompletionBackend for OpenAiClient {
    async fn complete(&self, req: &CompletionRequest) -> Result<String, ApiError> {
        let url = format!("{}/chat/completions", self.api_base);
        let body = OpenAiRequest {
            model: &req.model,
            messages: req.messages(),
            max_tokens: req.max_tokens,
            n: 1,
            temperature: req.temperature,
        };
        tracing::debug!(%url, model = %req.model, "sending completion request");
        let res = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let text = res.text().await.unwrap_or_default();
            return Err(ApiError::RateLimited(text));
        }
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(ApiError::Status { status: status.as_u16(), body: text });
        }
        let bytes = res.bytes().await?;
        let parsed: OpenAiResponse =
            serde_json::from_slice(&bytes).map_err(|e| ApiError::Parse(e.to_string()))?;
        let choice = parsed.choices.into_iter().next().ok_or(ApiError::EmptyChoices)?;
        let content = choice
            .message
            .and_then(|m| m.content)
            .ok_or_else(|| ApiError::Parse("missing choices[0].message.content".into()))?;
        Ok(content.trim().to_string())
    }
}

/// Ask `backend` for a completion of one chunk, retrying only on rate limits.
///
/// Every failure is logged here and collapsed to `None`; callers only see
/// whether the chunk produced text.
pub async fn complete_chunk<B: CompletionBackend + ?Sized>(
    backend: &B,
    req: &CompletionRequest,
    policy: &RetryPolicy,
) -> Option<String> {
    let result = retry_with_backoff(policy, ApiError::is_rate_limit, |_| backend.complete(req)).await;
    match result {
        Ok(text) => Some(text.trim().to_string()),
        Err(RetryError::Fatal(e)) => {
            tracing::error!("API call failed: {e}");
            None
        }
        Err(RetryError::Exhausted { attempts, last }) => {
            tracing::error!("failed to call the completion API after {attempts} attempts due to rate limiting: {last}");
            None
        }
    }
}
