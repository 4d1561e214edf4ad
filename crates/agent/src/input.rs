//! Input handlers: preprocessing of user-originated input.
//!
//! Handlers run in order on text that came from the user (the initial task,
//! an answer at the await-user step, an interrupt note), never on tool
//! results. Each may rewrite the text, attach an addon for the next prompt,
//! or stop the turn before the model is called.

use async_trait::async_trait;
use std::sync::OnceLock;
use turnstile_core::error::Result;

use crate::prompts::{RETRIEVE_MEMORY_TOOL, SAVE_MEMORY_TOOL};

/// A session operation an input handler asks the agent to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// Compact the conversation now.
    Summarize,
    /// Reset the session (user data survives).
    Clear,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputOutcome {
    /// Pass `text` on. A non-empty `addon` replaces the default addon once.
    Forward { text: String, addon: Option<String> },
    /// Skip the model call this turn, after running `command`.
    Return { command: Option<SessionCommand> },
}

/// What an input handler can see of the agent.
#[derive(Debug, Clone, Default)]
pub struct InputContext {
    pub tool_names: Vec<String>,
    /// Full description of the agent's actions.
    pub action_prompt: String,
}

#[async_trait]
pub trait InputHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn process(&self, input: String, context: &InputContext) -> Result<InputOutcome>;
}

/// The `'<Directive>'` markers understood in user input.
///
/// - `'<Summary>'` compacts history and skips the model call
/// - `'<Clear>'` clears the session and skips the model call
/// - `'<ToolUsage>'` sends the action reference as the addon
/// - `'<Thinking>'` asks the model to re-examine its work
/// - `'<DirectAnswer>'` asks for an answer without actions
///
/// Memory hints are added to the addon when the memory tools exist.
#[derive(Debug, Default)]
pub struct BuiltinDirectives;

const THINKING_ADDON: &str = "Think it over carefully once more and look for possible mistakes and problems.";
const DIRECT_ANSWER_ADDON: &str = "Do not perform any action; answer the question directly.";

fn directive_regex() -> &'static regex_lite::Regex {
    static RE: OnceLock<regex_lite::Regex> = OnceLock::new();
    RE.get_or_init(|| regex_lite::Regex::new(r"'<(\w+)>'").expect("static directive pattern"))
}

fn directives(input: &str) -> Vec<&str> {
    directive_regex()
        .captures_iter(input)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect()
}

#[async_trait]
impl InputHandler for BuiltinDirectives {
    fn name(&self) -> &str {
        "builtin_directives"
    }

    async fn process(&self, input: String, context: &InputContext) -> Result<InputOutcome> {
        let found = directives(&input);

        if found.contains(&"Summary") {
            return Ok(InputOutcome::Return {
                command: Some(SessionCommand::Summarize),
            });
        }
        if found.contains(&"Clear") {
            return Ok(InputOutcome::Return {
                command: Some(SessionCommand::Clear),
            });
        }
        if found.contains(&"ToolUsage") {
            return Ok(InputOutcome::Forward {
                text: String::new(),
                addon: Some(context.action_prompt.clone()),
            });
        }

        let mut text = input.clone();
        let mut addon = Vec::new();
        for (tag, template) in [("Thinking", THINKING_ADDON), ("DirectAnswer", DIRECT_ANSWER_ADDON)] {
            if found.contains(&tag) {
                text = text.replace(&format!("'<{tag}>'"), "");
                addon.push(template.to_string());
            }
        }

        // Hints only accompany a directive addon.
        if !addon.is_empty() {
            if context.tool_names.iter().any(|n| n == SAVE_MEMORY_TOOL) {
                addon.push("If there is key information to remember, call save_memory.".into());
            }
            if context.tool_names.iter().any(|n| n == RETRIEVE_MEMORY_TOOL) {
                addon.push("If related memories would help, call retrieve_memory.".into());
            }
        }

        Ok(InputOutcome::Forward {
            text,
            addon: (!addon.is_empty()).then(|| addon.join("\n")),
        })
    }
}
