//! Per-agent session state.

use std::collections::HashMap;
use turnstile_core::message::Message;

use super::token::estimate_tokens;

/// The mutable state one agent carries between turns.
///
/// `conversation_length` is always the sum of the token estimates of the
/// texts in `history`: everything sent to or received from the model since
/// the last compaction.
#[derive(Debug, Default)]
pub struct Session {
    /// Input waiting to be sent. Cleared after each send.
    pub prompt: String,
    /// One-shot addon, consumed by the next prompt assembly.
    pub addon_prompt: String,
    conversation_length: usize,
    user_data: HashMap<String, serde_json::Value>,
    history: Vec<Message>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversation_length(&self) -> usize {
        self.conversation_length
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn set_user_data(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.user_data.insert(key.into(), value);
    }

    pub fn get_user_data(&self, key: &str) -> Option<&serde_json::Value> {
        self.user_data.get(key)
    }

    /// Record text sent to the model.
    pub fn record_sent(&mut self, text: &str) {
        self.conversation_length += estimate_tokens(text);
        self.history.push(Message::user(text));
    }

    /// Record text received from the model.
    pub fn record_received(&mut self, text: &str) {
        self.conversation_length += estimate_tokens(text);
        self.history.push(Message::assistant(text));
    }

    /// Drop the transcript, the pending prompt and the length.
    /// `user_data` and `addon_prompt` survive.
    pub fn clear_history(&mut self) {
        self.prompt.clear();
        self.conversation_length = 0;
        self.history.clear();
    }

    /// Reset everything conversational. `user_data` survives.
    pub fn clear(&mut self) {
        self.clear_history();
        self.addon_prompt.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_tracks_history() {
        let mut session = Session::new();
        session.record_sent("12345678");
        session.record_received("1234");
        assert_eq!(session.conversation_length(), 3);
        assert_eq!(session.history().len(), 2);

        let sum: usize = session
            .history()
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .sum();
        assert_eq!(sum, session.conversation_length());
    }

    #[test]
    fn clear_keeps_user_data() {
        let mut session = Session::new();
        session.set_user_data("ticket", serde_json::json!("T-42"));
        session.prompt = "pending".into();
        session.addon_prompt = "addon".into();
        session.record_sent("hello");

        session.clear();

        assert!(session.prompt.is_empty());
        assert!(session.addon_prompt.is_empty());
        assert_eq!(session.conversation_length(), 0);
        assert!(session.history().is_empty());
        assert_eq!(session.get_user_data("ticket"), Some(&serde_json::json!("T-42")));
    }

    #[test]
    fn clear_history_keeps_addon() {
        let mut session = Session::new();
        session.addon_prompt = "addon".into();
        session.record_sent("hello");
        session.clear_history();
        assert_eq!(session.addon_prompt, "addon");
        assert_eq!(session.conversation_length(), 0);
    }

    #[test]
    fn user_data_overwrites() {
        let mut session = Session::new();
        session.set_user_data("k", serde_json::json!(1));
        session.set_user_data("k", serde_json::json!(2));
        assert_eq!(session.get_user_data("k"), Some(&serde_json::json!(2)));
        assert!(session.get_user_data("missing").is_none());
    }
}
