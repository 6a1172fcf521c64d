//! Abstract text-completion collaborator.
//!
//! The pipeline, message generator, and mention handler only depend on
//! [`Completer`]; [`HttpCompleter`] is the sole implementation in scope,
//! built directly against a chat-completions-shaped HTTP endpoint rather
//! than routing across multiple vendor SDKs.

use crate::error::{GenerationError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A single turn in a completion request.
#[derive(Debug, Clone)]
pub enum ChatMessage {
    System(String),
    User(String),
    Assistant(String),
}

/// Token and cost accounting for a single completion call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub text: String,
    pub usage: Usage,
}

/// Abstract text-generation collaborator.
pub trait Completer: Send + Sync + 'static {
    fn complete(
        &self,
        messages: Vec<ChatMessage>,
        max_tokens: u32,
        temperature: f32,
        reasoning_effort: Option<&str>,
    ) -> impl std::future::Future<Output = Result<CompletionOutcome>> + Send;
}

/// Request body shape accepted by OpenAI-compatible and
/// Anthropic-compatible chat completion endpoints alike.
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<&'a str>,
    messages: Vec<WireMessage>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: WireMessage2,
}

#[derive(Debug, Deserialize)]
struct WireMessage2 {
    content: String,
}

#[derive(Debug, Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// HTTP-backed [`Completer`] speaking a chat-completions dialect.
pub struct HttpCompleter {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl HttpCompleter {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(90))
            .build()
            .expect("failed to build LLM http client");
        Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

impl Completer for HttpCompleter {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        max_tokens: u32,
        temperature: f32,
        reasoning_effort: Option<&str>,
    ) -> Result<CompletionOutcome> {
        let wire = messages
            .into_iter()
            .map(|m| match m {
                ChatMessage::System(text) => WireMessage { role: "system", content: text },
                ChatMessage::User(text) => WireMessage { role: "user", content: text },
                ChatMessage::Assistant(text) => WireMessage { role: "assistant", content: text },
            })
            .collect();

        let body = ChatRequest {
            model: &self.model,
            max_tokens,
            temperature,
            reasoning_effort,
            messages: wire,
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::UpstreamTransient(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(GenerationError::RateLimited.into());
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(GenerationError::UpstreamRefused(format!("{status}: {text}")).into());
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| GenerationError::UpstreamTransient(e.to_string()))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| GenerationError::UpstreamRefused("empty completion choices".into()))?;
        let usage = parsed
            .usage
            .map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        tracing::info!(
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "llm completion"
        );

        Ok(CompletionOutcome { text, usage })
    }
}
