//! Output handlers: components that own one kind of action.
//!
//! Every model response is offered to the registered handlers in order. The
//! first handler whose [`OutputHandler::can_handle`] returns `true` executes;
//! the rest are never consulted. New action kinds plug in by implementing
//! this trait, without touching the agent loop.

use async_trait::async_trait;
use std::sync::Arc;

use crate::action::{ParsedResponse, RoutedMessage};
use crate::error::Result;

/// A result that ends the run and goes straight back to the loop's caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionResult {
    Text(String),
    Message(RoutedMessage),
}

/// What executing a matched action produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The text becomes the next turn's input. Empty text means "nothing to
    /// report" and lets the loop fall through to asking the user.
    Continue(String),
    /// End the run with this result.
    Terminate(ActionResult),
}

impl HandlerOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HandlerOutcome::Terminate(_))
    }
}

#[async_trait]
pub trait OutputHandler: Send + Sync {
    /// Stable identifier, also the action name listed to the model.
    fn name(&self) -> &str;

    /// Structural test only. Must not mutate state.
    fn can_handle(&self, response: &ParsedResponse) -> bool;

    /// Execute the matched action.
    async fn handle(&self, response: &ParsedResponse) -> Result<HandlerOutcome>;

    /// Prompt fragment describing this action and its syntax.
    fn prompt(&self) -> String;
}

/// The first handler, in registration order, that accepts `response`.
pub fn first_match<'a>(
    handlers: &'a [Arc<dyn OutputHandler>],
    response: &ParsedResponse,
) -> Option<&'a Arc<dyn OutputHandler>> {
    handlers.iter().find(|h| h.can_handle(response))
}
