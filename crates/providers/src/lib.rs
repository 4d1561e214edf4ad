//! Model service implementations for Turnstile.
//!
//! All services implement the `turnstile_core::ModelService` trait.

pub mod openai_compat;
pub mod retry;

pub use openai_compat::OpenAiChat;
pub use retry::RetryPolicy;
