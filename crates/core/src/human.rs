//! Human input: the operator on the other side of the loop.

use async_trait::async_trait;

/// Source of human answers: intervention text, next instructions, yes/no
/// confirmations.
#[async_trait]
pub trait HumanInput: Send + Sync {
    /// Ask a free-text question. An empty answer means "nothing to add".
    async fn ask(&self, prompt: &str) -> String;

    /// Ask a yes/no question; `default` applies when the answer is blank.
    async fn confirm(&self, prompt: &str, default: bool) -> bool;
}

/// Answers every question with nothing and every confirmation with its
/// default. Used for unattended runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unattended;

#[async_trait]
impl HumanInput for Unattended {
    async fn ask(&self, _prompt: &str) -> String {
        String::new()
    }

    async fn confirm(&self, _prompt: &str, default: bool) -> bool {
        default
    }
}
