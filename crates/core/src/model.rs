//! Model service trait: the abstraction over the language model.
//!
//! The agent loop treats the model as a stateful chat session: it sets a
//! system prompt once, sends one prompt per turn and receives raw text back.
//! Conversation history lives inside the service; `reset` drops it.
//!
//! Retrying transient failures is the service's own job. An `Err` returned
//! from `chat` means the service has already given up.

use async_trait::async_trait;
use std::path::PathBuf;

use crate::error::ProviderError;

/// The core model service trait.
#[async_trait]
pub trait ModelService: Send + Sync {
    /// A human-readable name (e.g. "openai/gpt-4o").
    fn name(&self) -> &str;

    /// Replace the system prompt used for subsequent turns.
    fn set_system_prompt(&self, prompt: &str);

    /// Send one prompt and block until the full response text is available.
    async fn chat(&self, prompt: &str) -> std::result::Result<String, ProviderError>;

    /// Drop all accumulated conversation context, keeping the system prompt.
    async fn reset(&self);

    /// Whether `upload_files` is supported.
    fn supports_file_upload(&self) -> bool {
        false
    }

    /// Upload files as conversation context. Returns `true` on success.
    async fn upload_files(&self, _paths: &[PathBuf]) -> bool {
        false
    }
}
