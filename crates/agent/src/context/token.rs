//! Token estimation and the context-window budget.
//!
//! Uses a character-based heuristic: ~4 characters per token, rounded up.
//! Every count the loop keeps (conversation length, tool output size) goes
//! through [`estimate_tokens`] so the numbers stay comparable.

/// Estimate the token count for a string.
///
/// Heuristic: 1 token ≈ 4 bytes. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    text.len().div_ceil(4)
}

/// The context-window limit of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudget {
    max_tokens: usize,
}

impl TokenBudget {
    pub fn new(max_tokens: usize) -> Self {
        Self { max_tokens }
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Whether a conversation of `conversation_length` tokens must be compacted
    /// before the next send.
    pub fn should_compact(&self, conversation_length: usize) -> bool {
        conversation_length > self.max_tokens
    }

    /// How many tokens a single tool report may take: 80 % of the window.
    pub fn tool_output_budget(&self) -> usize {
        self.max_tokens / 5 * 4 + self.max_tokens % 5 * 4 / 5
    }

    pub fn fits_tool_output(&self, text: &str) -> bool {
        estimate_tokens(text) <= self.tool_output_budget()
    }
}

/// The last `tokens` worth of `text`, cut on a char boundary.
pub fn tail_tokens(text: &str, tokens: usize) -> &str {
    let keep = tokens.saturating_mul(4);
    if text.len() <= keep {
        return text;
    }
    let mut start = text.len() - keep;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
