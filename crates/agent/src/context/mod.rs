//! Conversation context: session state, token accounting and compaction.

pub mod compaction;
pub mod session;
pub mod token;

pub use compaction::{Compaction, CompactionMode};
pub use session::Session;
pub use token::{TokenBudget, estimate_tokens};
