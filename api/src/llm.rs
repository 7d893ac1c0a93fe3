//! LLM provider seam.
//!
//! The pipeline only needs one call shape: a prompt, an optional JSON schema
//! for structured output, and generation limits. Provider wire protocols are
//! kept behind [`LlmProvider`]; the bundled [`HttpLlmProvider`] speaks a plain
//! JSON envelope to a gateway.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("no LLM provider configured")]
    NotConfigured,
    #[error("LLM request failed: {0}")]
    Request(String),
    #[error("LLM returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("LLM response could not be decoded: {0}")]
    Decode(String),
    #[error("LLM call timed out")]
    Timeout,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub prompt: String,
    /// JSON schema the answer must satisfy; `None` for free text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn text(prompt: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            prompt: prompt.into(),
            schema: None,
            max_tokens,
            temperature: 0.3,
        }
    }

    pub fn structured(prompt: impl Into<String>, schema: serde_json::Value) -> Self {
        Self {
            prompt: prompt.into(),
            schema: Some(schema),
            max_tokens: 400,
            temperature: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Completion {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub json: Option<serde_json::Value>,
}

impl Completion {
    /// Structured payload, falling back to parsing the text body as JSON.
    pub fn json_payload(&self) -> Option<serde_json::Value> {
        self.json
            .clone()
            .or_else(|| serde_json::from_str(self.text.trim()).ok())
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError>;
}

/// Call the provider under a deadline.
pub async fn complete_within(
    provider: &dyn LlmProvider,
    request: CompletionRequest,
    timeout: Duration,
) -> Result<Completion, LlmError> {
    match tokio::time::timeout(timeout, provider.complete(request)).await {
        Ok(result) => result,
        Err(_) => Err(LlmError::Timeout),
    }
}

/// JSON-over-HTTP gateway: `POST {base_url}/complete` with the request body,
/// answered by `{"text": ..., "json": ...}`.
pub struct HttpLlmProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpLlmProvider {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl LlmProvider for HttpLlmProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
        let mut builder = self
            .client
            .post(format!("{}/complete", self.base_url))
            .json(&request);
        if let Some(key) = self.api_key.as_deref() {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json::<Completion>()
            .await
            .map_err(|e| LlmError::Decode(e.to_string()))
    }
}

/// Stand-in used when no gateway is configured. Every call fails, which
/// drives the deterministic fallbacks of each stage.
pub struct UnconfiguredLlm;

#[async_trait]
impl LlmProvider for UnconfiguredLlm {
    fn name(&self) -> &'static str {
        "unconfigured"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<Completion, LlmError> {
        Err(LlmError::NotConfigured)
    }
}

#[cfg(test)]
pub mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Replays queued responses in order; errors once the queue is empty.
    pub struct ScriptedLlm {
        responses: Mutex<VecDeque<Result<Completion, LlmError>>>,
        pub prompts: Mutex<Vec<String>>,
        delay: Option<Duration>,
    }

    impl ScriptedLlm {
        pub fn new(responses: Vec<Result<Completion, LlmError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                prompts: Mutex::new(Vec::new()),
                delay: None,
            }
        }

        pub fn texts(texts: &[&str]) -> Self {
            Self::new(
                texts
                    .iter()
                    .map(|text| {
                        Ok(Completion {
                            text: (*text).to_string(),
                            json: None,
                        })
                    })
                    .collect(),
            )
        }

        pub fn slow(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::new(Vec::new())
            }
        }

        pub fn call_count(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
            self.prompts.lock().unwrap().push(request.prompt);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(LlmError::NotConfigured))
        }
    }
}
