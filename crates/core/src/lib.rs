//! # Turnstile Core
//!
//! Domain types, traits, and error definitions for the Turnstile agent
//! execution core. This crate has **no framework dependencies**: it defines
//! the model that the loop, the tools, and the providers implement against.
//!
//! ## Seams
//!
//! - [`ModelService`]: the language model as a stateful chat session
//! - [`OutputHandler`]: one kind of action found in model output
//! - [`Tool`]: a named capability the dispatcher can execute
//! - [`HumanInput`]: the operator answering questions and confirmations

pub mod action;
pub mod error;
pub mod event;
pub mod handler;
pub mod human;
pub mod interrupt;
pub mod message;
pub mod model;
pub mod tool;

#[cfg(feature = "test-utils")]
pub mod testing;

// Re-export key types at crate root for ergonomics
pub use action::{Action, ActionKind, ParsedResponse, PatchBlock, RoutedMessage, ToolArguments, ToolCall};
pub use error::{Error, ProviderError, Result, ToolError};
pub use event::{DomainEvent, EventBus};
pub use handler::{ActionResult, HandlerOutcome, OutputHandler};
pub use human::{HumanInput, Unattended};
pub use interrupt::InterruptSignal;
pub use message::{Message, Role};
pub use model::ModelService;
pub use tool::{Tool, ToolDefinition, ToolOutput, ToolRegistry};
