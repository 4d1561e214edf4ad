//! Prompt text the loop sends on its own behalf.

use std::path::PathBuf;
use std::sync::Arc;
use turnstile_core::action::{TOOL_CALL_TAG, open_tag};
use turnstile_core::handler::OutputHandler;

/// Marker a model emits to end the run when auto-complete is on.
pub const COMPLETE_MARKER: &str = "!!!COMPLETE!!!";

pub const SAVE_MEMORY_TOOL: &str = "save_memory";
pub const RETRIEVE_MEMORY_TOOL: &str = "retrieve_memory";

/// Base system prompt for agents built without one.
pub fn default_system_prompt() -> String {
    format!(
        r#"<role>
You are a task execution assistant. You plan the work the user asks for and carry it out step by step.
</role>

<rules>
1. Every response contains exactly one action.
2. When the task is finished, say so plainly. That is the only response allowed without an action.
3. Never answer with analysis alone while work remains; always end with the next action.
4. Wait for the result of an action before deciding the next one.
5. Reply in the user's language.
</rules>

<system_info>
- OS: {}
- Time: {}
</system_info>
"#,
        std::env::consts::OS,
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    )
}

/// Appended to every prompt that has no caller-supplied addon.
pub fn default_addon(action_names: &[&str], tool_names: &[&str], offer_complete: bool) -> String {
    let complete = if offer_complete {
        format!("\n    - output {}", open_tag(COMPLETE_MARKER))
    } else {
        String::new()
    };

    let mut memory = String::new();
    if tool_names.contains(&SAVE_MEMORY_TOOL) {
        memory.push_str(
            "\n    - to remember key information, call save_memory with one of:\
             \n      * project_long_term: long-lived facts about the current project\
             \n      * global_long_term: general knowledge, user preferences, methods\
             \n      * short_term: temporary facts for the current task",
        );
    }
    if tool_names.contains(&RETRIEVE_MEMORY_TOOL) {
        memory.push_str("\n    - to recall stored information, call retrieve_memory");
    }

    format!(
        r#"
<system_prompt>
    Decide whether the task is finished. If it is:
    - state why it is finished, take no further action and do not output a {tool_tag} tag{complete}
    If it is not, take the next step:
    - include exactly one action
    - if information is missing, ask the user for it
    - after 5 consecutive failures, use ask_user to ask the user how to proceed
    - available actions: {actions}{memory}
</system_prompt>

Please continue.
"#,
        tool_tag = open_tag(TOOL_CALL_TAG),
        actions = action_names.join(", "),
    )
}

/// Every handler's self-description, in registration order.
pub fn action_prompt(handlers: &[Arc<dyn OutputHandler>]) -> String {
    let mut prompt = String::from(
        "<actions>\n# Available actions\nUse exactly one action per response, in the syntax shown.\n",
    );
    for handler in handlers {
        prompt.push_str(&format!("\n## {}\n{}\n", handler.name(), handler.prompt().trim_end()));
    }
    prompt.push_str("</actions>\n");
    prompt
}

pub const SUMMARY_REQUEST_PROMPT: &str = r#"<summary_request>
Summarize the conversation so far so the task can continue in a fresh context.
Keep:
- the goal and every requirement the user stated
- what has been done and what each step produced
- exact file paths, commands, numbers, identifiers and error messages
- decisions made and the reasons given
- what remains to be done next
Omit greetings and repetition. Output only the summary.
</summary_request>"#;

/// Seed for the first prompt after a summary compaction.
pub fn summary_seed(summary: &str) -> String {
    format!(
        "Key information from the previous conversation:\n<content>\n{summary}\n</content>\n\n\
         Continue the task from here. The context was reset because it exceeded the limit; \
         do not repeat steps that are already done."
    )
}

/// Seed for the first prompt after the transcript was uploaded.
pub const UPLOAD_SEED: &str =
    "The uploaded file contains the previous conversation history. Continue the task based on it.";

/// Summary requested at the end of a run when none is configured.
pub const DEFAULT_SUMMARY_PROMPT: &str = r#"<report>
Write a short report of the task:
- the outcome, and whether the goal was met
- the key results: files changed, values found, commands that mattered
- anything left unfinished and why
</report>"#;

pub const TASK_ANALYSIS_PROMPT: &str = r#"<task_analysis>
The task has ended. Review how it went before closing:
1. Which steps worked, which failed, and why.
2. Whether a repeatable method came out of it that would help with similar tasks next time.
3. Whether a missing tool would have made the task easier.
If something is worth keeping, use the available actions to record it (one action per response).
When there is nothing more to do, answer without any action.
</task_analysis>"#;

pub const MEMORY_SAVE_PROMPT: &str = r#"Review the whole task and decide whether anything is worth remembering.

Use save_memory for information such as:
1. a new technique for solving a problem (global_long_term)
2. important findings or settings of this project (project_long_term)
3. preferences or habits of the user (global_long_term)
4. technical knowledge or lessons learned (global_long_term)
5. conventions or implementation details specific to this project (project_long_term)

Pick a fitting memory type and tags. If nothing is worth keeping, say so without any action."#;

pub fn interrupt_note(intervention: &str) -> String {
    format!("Interrupted by the user, who added: {intervention}")
}

pub fn interrupt_accepted(intervention: &str) -> String {
    format!(
        "{}\n\nThe user agreed to continue with the pending action.",
        interrupt_note(intervention)
    )
}

pub fn interrupt_declined(intervention: &str) -> String {
    format!(
        "{}\n\nAn action was pending but the user refused to run it. \
         Reconsider the next step in light of what the user added.",
        interrupt_note(intervention)
    )
}

/// Points the model at files it could not be sent directly.
pub fn file_listing(files: &[PathBuf]) -> String {
    let lines: Vec<String> = files.iter().map(|f| format!("- {}", f.display())).collect();
    format!(
        "\n\nFiles relevant to this task (read them with a tool when needed):\n{}",
        lines.join("\n")
    )
}

pub fn next_input_question(agent: &str) -> String {
    format!("{agent}: enter input, or a blank line to finish")
}
