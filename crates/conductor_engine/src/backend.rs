//! Task execution against a single (provider, model) pair.
//!
//! The router only sees the [`Backend`] trait. [`HttpBackend`] speaks the
//! OpenAI-compatible chat completions format that llama.cpp, vLLM, LocalAI
//! and most cloud gateways accept.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{Provider, TaskDescriptor};

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout")]
    Timeout,

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed response: {0}")]
    Decode(String),
}

/// A finished completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    pub tokens_used: u64,
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn execute(
        &self,
        provider: &Provider,
        model: &str,
        task: &TaskDescriptor,
    ) -> Result<Completion, BackendError>;
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
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
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    total_tokens: Option<u64>,
}

/// Rough token count when the server reports no usage: ~4 chars per token.
pub fn estimate_tokens(text: &str) -> u64 {
    text.len().div_ceil(4) as u64
}

/// Environment variable holding the bearer token for a provider, e.g.
/// `CONDUCTOR_OPENROUTER_API_KEY` for `openrouter`.
pub fn api_key_var(provider_id: &str) -> String {
    let id: String = provider_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("CONDUCTOR_{id}_API_KEY")
}

// ---------------------------------------------------------------------------
// HttpBackend
// ---------------------------------------------------------------------------

/// `POST {endpoint}/v1/chat/completions`. Timeouts are enforced by the
/// router, so the client itself has none.
#[derive(Debug, Clone, Default)]
pub struct HttpBackend {
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse(body: ChatCompletion, prompt: &str) -> Result<Completion, BackendError> {
        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Decode("no choices in response".into()))?;
        let content = choice.message.content.unwrap_or_default();
        let tokens_used = match body.usage {
            Some(Usage {
                total_tokens: Some(total),
                ..
            }) => total,
            Some(Usage {
                prompt_tokens,
                completion_tokens,
                ..
            }) if prompt_tokens.is_some() || completion_tokens.is_some() => {
                prompt_tokens.unwrap_or(0) + completion_tokens.unwrap_or(0)
            }
            _ => estimate_tokens(prompt) + estimate_tokens(&content),
        };
        Ok(Completion {
            content,
            tokens_used,
        })
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn execute(
        &self,
        provider: &Provider,
        model: &str,
        task: &TaskDescriptor,
    ) -> Result<Completion, BackendError> {
        let url = format!(
            "{}/v1/chat/completions",
            provider.endpoint.trim_end_matches('/')
        );
        let body = ChatBody {
            model,
            messages: [ChatMessage {
                role: "user",
                content: &task.prompt,
            }],
            stream: false,
        };

        let mut request = self.client.post(&url).json(&body);
        if let Ok(key) = std::env::var(api_key_var(&provider.id))
            && !key.is_empty()
        {
            request = request.bearer_auth(key);
        }

        debug!(provider = %provider.id, model, task_id = %task.id, "Sending completion request");
        let resp = request.send().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout
            } else {
                BackendError::Network(e.to_string())
            }
        })?;

        let status = resp.status();
        if status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::GATEWAY_TIMEOUT
        {
            return Err(BackendError::Timeout);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let data: ChatCompletion = resp
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        Self::parse(data, &task.prompt)
    }
}
