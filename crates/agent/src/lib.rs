//! The Turnstile agent loop.
//!
//! An [`Agent`] drives a turn-based dialogue between a model session and a
//! set of output handlers:
//!
//! 1. **Assemble** the pending prompt plus exactly one addon
//! 2. **Budget**: compact the history first if it outgrew the context window
//! 3. **Send** to the model and parse the reply into typed actions
//! 4. **Checkpoint**: if the operator interrupted, ask what to do
//! 5. **Route** the parse to the first handler that accepts it
//! 6. **Feed** the handler's result into the next turn, or end the run
//!
//! With nothing to act on, the loop asks the operator for the next input; a
//! blank answer completes the task.

pub mod context;
pub mod dispatcher;
pub mod input;
pub mod loop_runner;
pub mod methodology;
pub mod multi_agent;
pub mod prompts;

pub use context::{Compaction, CompactionMode, Session, TokenBudget};
pub use dispatcher::ToolDispatcher;
pub use input::{BuiltinDirectives, InputContext, InputHandler, InputOutcome, SessionCommand};
pub use loop_runner::{AfterActionHook, Agent, RunOutcome};
pub use methodology::MethodologyLibrary;
pub use multi_agent::{MultiAgent, SendMessageRouter};
