//! OpenAI-compatible chat session.
//!
//! Works with: OpenAI, OpenRouter, Ollama, vLLM, llama.cpp server, and any
//! endpoint exposing `/chat/completions`.
//!
//! The session keeps the system prompt and the running history locally and
//! replays them on every request, so the agent loop can treat the model as a
//! stateful conversation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};
use turnstile_config::ModelConfig;
use turnstile_core::error::ProviderError;
use turnstile_core::message::{Message, Role};
use turnstile_core::model::ModelService;

use crate::retry::RetryPolicy;

#[derive(Default)]
struct ChatState {
    system_prompt: String,
    history: Vec<Message>,
}

/// A chat session against an OpenAI-compatible endpoint.
pub struct OpenAiChat {
    name: String,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    retry: RetryPolicy,
    client: reqwest::Client,
    state: Mutex<ChatState>,
}

impl OpenAiChat {
    /// Create a new session.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {e}")))?;

        let model = model.into();
        Ok(Self {
            name: format!("openai-compat/{model}"),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model,
            temperature: 0.7,
            retry: RetryPolicy::default(),
            client,
            state: Mutex::new(ChatState::default()),
        })
    }

    /// Build from the `[model]` config section.
    pub fn from_config(config: &ModelConfig) -> Result<Self, ProviderError> {
        let api_key = config.api_key.clone().ok_or_else(|| {
            ProviderError::NotConfigured(
                "no API key (set model.api_key, TURNSTILE_API_KEY or OPENAI_API_KEY)".into(),
            )
        })?;
        Ok(Self::new(&config.base_url, api_key, &config.model)?
            .with_temperature(config.temperature)
            .with_retry(RetryPolicy::new(config.max_retries)))
    }

    /// Convenience constructor for a local Ollama server.
    pub fn ollama(model: impl Into<String>) -> Result<Self, ProviderError> {
        Self::new("http://localhost:11434/v1", "ollama", model)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self.name = format!("openai-compat/{}", self.model);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Number of messages currently replayed on each request.
    pub fn history_len(&self) -> usize {
        self.lock_state().history.len()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ChatState> {
        // A poisoned lock only means another turn panicked mid-update.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// System prompt, history, then the new user prompt.
    fn build_messages(&self, prompt: &str) -> Vec<ApiMessage> {
        let state = self.lock_state();
        let mut messages = Vec::with_capacity(state.history.len() + 2);
        if !state.system_prompt.is_empty() {
            messages.push(ApiMessage::new(Role::System, &state.system_prompt));
        }
        messages.extend(state.history.iter().map(|m| ApiMessage::new(m.role, &m.content)));
        messages.push(ApiMessage::new(Role::User, prompt));
        messages
    }

    async fn send_once(&self, messages: &[ApiMessage]) -> Result<String, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ApiRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            stream: false,
        };

        debug!(service = %self.name, messages = messages.len(), "Sending chat request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status().as_u16();

        if status == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(5);
            return Err(ProviderError::RateLimited { retry_after_secs });
        }

        if status == 401 || status == 403 {
            return Err(ProviderError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            ));
        }

        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Model service returned error");
            return Err(ProviderError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        let api_response: ApiResponse =
            response.json().await.map_err(|e| ProviderError::ApiError {
                status_code: 200,
                message: format!("Failed to parse response: {e}"),
            })?;

        extract_content(api_response)
    }
}

fn extract_content(response: ApiResponse) -> Result<String, ProviderError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::ApiError {
            status_code: 200,
            message: "No choices in response".into(),
        })?;
    Ok(choice.message.content.unwrap_or_default())
}

#[async_trait]
impl ModelService for OpenAiChat {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_system_prompt(&self, prompt: &str) {
        self.lock_state().system_prompt = prompt.to_string();
    }

    async fn chat(&self, prompt: &str) -> Result<String, ProviderError> {
        let messages = self.build_messages(prompt);
        let reply = self.retry.run(&self.name, || self.send_once(&messages)).await?;

        let mut state = self.lock_state();
        state.history.push(Message::user(prompt));
        state.history.push(Message::assistant(&reply));
        Ok(reply)
    }

    async fn reset(&self) {
        self.lock_state().history.clear();
    }
}

// --- OpenAI API types ---

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: &'a [ApiMessage],
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

impl ApiMessage {
    fn new(role: Role, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}
