//! Structured actions extracted from model text.
//!
//! A model response is scanned once for tagged action blocks and turned into
//! a [`ParsedResponse`]: a list of typed [`Action`]s plus the blocks that had
//! the right tag but could not be understood. Handlers decide whether they own
//! a response by matching on these variants instead of re-scanning the text.
//!
//! # Block syntax
//!
//! ```text
//! <TOOL_CALL>
//! name: execute_shell
//! arguments:
//!     command: |
//!         git status
//! </TOOL_CALL>
//!
//! <SEND_MESSAGE>
//! to: reviewer
//! content: |
//!     Please review the patch.
//! </SEND_MESSAGE>
//!
//! <PATCH>
//! File: src/lib.rs
//! Reason: fix typo
//! <<<<<<< SEARCH
//! old line
//! =======
//! new line
//! >>>>>>> REPLACE
//! </PATCH>
//! ```

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

pub const TOOL_CALL_TAG: &str = "TOOL_CALL";
pub const SEND_MESSAGE_TAG: &str = "SEND_MESSAGE";
pub const PATCH_TAG: &str = "PATCH";

/// `<TAG>`
pub fn open_tag(tag: &str) -> String {
    format!("<{tag}>")
}

/// `</TAG>`
pub fn close_tag(tag: &str) -> String {
    format!("</{tag}>")
}

/// Arguments of a tool call as they appeared in the block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolArguments {
    /// A key/value mapping, ready to execute.
    Structured(serde_json::Map<String, serde_json::Value>),
    /// Free text the model wrote instead of a mapping; must be parsed first.
    Raw(String),
}

impl Default for ToolArguments {
    fn default() -> Self {
        Self::Structured(serde_json::Map::new())
    }
}

/// A request to execute a named tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Name of the tool to execute
    pub name: String,

    /// Arguments as written by the model
    #[serde(default)]
    pub arguments: ToolArguments,
}

/// A message addressed to another agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutedMessage {
    pub to: String,
    pub content: String,
}

/// The edit carried by a patch block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchBody {
    /// Replace the first occurrence of `search` with `replace`.
    SearchReplace { search: String, replace: String },
    /// Write the whole file.
    FullContent(String),
}

/// A file edit requested by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchBlock {
    pub file: String,
    pub reason: String,
    pub body: PatchBody,
}

/// The kinds of action a response can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    ToolCall,
    SendMessage,
    Patch,
}

impl ActionKind {
    /// The block tag for this kind.
    pub fn tag(self) -> &'static str {
        match self {
            ActionKind::ToolCall => TOOL_CALL_TAG,
            ActionKind::SendMessage => SEND_MESSAGE_TAG,
            ActionKind::Patch => PATCH_TAG,
        }
    }
}

/// A single structured action.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    ToolCall(ToolCall),
    SendMessage(RoutedMessage),
    Patch(PatchBlock),
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::ToolCall(_) => ActionKind::ToolCall,
            Action::SendMessage(_) => ActionKind::SendMessage,
            Action::Patch(_) => ActionKind::Patch,
        }
    }
}

/// A tagged block that could not be turned into an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedBlock {
    pub kind: ActionKind,
    pub reason: String,
}

/// The typed view of one model response.
#[derive(Debug, Clone, Default)]
pub struct ParsedResponse {
    raw: String,
    actions: Vec<Action>,
    malformed: Vec<MalformedBlock>,
}

impl ParsedResponse {
    /// Scan `text` for every known action block.
    pub fn parse(text: &str) -> Self {
        let mut actions = Vec::new();
        let mut malformed = Vec::new();

        for kind in [ActionKind::ToolCall, ActionKind::SendMessage, ActionKind::Patch] {
            for body in extract_blocks(text, kind) {
                let parsed = match kind {
                    ActionKind::ToolCall => parse_tool_call(body).map(Action::ToolCall),
                    ActionKind::SendMessage => parse_send_message(body).map(Action::SendMessage),
                    ActionKind::Patch => parse_patch(body).map(Action::Patch),
                };
                match parsed {
                    Ok(action) => actions.push(action),
                    Err(reason) => malformed.push(MalformedBlock { kind, reason }),
                }
            }
        }

        Self {
            raw: text.to_string(),
            actions,
            malformed,
        }
    }

    /// The response text exactly as the model produced it.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// No action of any kind, only a plain assertion.
    pub fn is_plain(&self) -> bool {
        self.actions.is_empty() && self.malformed.is_empty()
    }

    pub fn count(&self, kind: ActionKind) -> usize {
        self.actions.iter().filter(|a| a.kind() == kind).count()
    }

    pub fn malformed(&self, kind: ActionKind) -> impl Iterator<Item = &MalformedBlock> {
        self.malformed.iter().filter(move |m| m.kind == kind)
    }

    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.actions
            .iter()
            .filter_map(|a| match a {
                Action::ToolCall(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    pub fn messages(&self) -> Vec<&RoutedMessage> {
        self.actions
            .iter()
            .filter_map(|a| match a {
                Action::SendMessage(msg) => Some(msg),
                _ => None,
            })
            .collect()
    }

    pub fn patches(&self) -> Vec<&PatchBlock> {
        self.actions
            .iter()
            .filter_map(|a| match a {
                Action::Patch(patch) => Some(patch),
                _ => None,
            })
            .collect()
    }

    /// Corrective text for a response no handler claimed: more than one
    /// block of a kind, or blocks that could not be parsed. `None` when the
    /// response has neither.
    pub fn protocol_feedback(&self) -> Option<String> {
        let mut problems = Vec::new();
        for kind in [ActionKind::ToolCall, ActionKind::SendMessage, ActionKind::Patch] {
            let count = self.count(kind);
            if count > 1 {
                problems.push(format!(
                    "{count} <{}> blocks were sent. Please only send one at a time.",
                    kind.tag()
                ));
            }
            for bad in self.malformed(kind) {
                problems.push(format!("Malformed <{}> block: {}.", kind.tag(), bad.reason));
            }
        }
        if problems.is_empty() {
            return None;
        }
        problems.push("Fix the block and send it again.".into());
        Some(problems.join("\n"))
    }

    /// Whether the raw text contains `<marker>`.
    pub fn has_marker(&self, marker: &str) -> bool {
        self.raw.contains(&open_tag(marker))
    }
}

fn block_regex(kind: ActionKind) -> &'static Regex {
    static TOOL: OnceLock<Regex> = OnceLock::new();
    static SEND: OnceLock<Regex> = OnceLock::new();
    static PATCH: OnceLock<Regex> = OnceLock::new();

    let cell = match kind {
        ActionKind::ToolCall => &TOOL,
        ActionKind::SendMessage => &SEND,
        ActionKind::Patch => &PATCH,
    };
    cell.get_or_init(|| {
        let tag = kind.tag();
        Regex::new(&format!(r"(?s)<{tag}>(.*?)</{tag}>")).expect("static block pattern")
    })
}

/// Return the inner text of every `<TAG>…</TAG>` block of the given kind.
pub fn extract_blocks(text: &str, kind: ActionKind) -> Vec<&str> {
    block_regex(kind)
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect()
}

/// Strip the common leading indentation so an indented block still parses.
fn dedent(text: &str) -> String {
    let indent = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);
    let mut out = text
        .lines()
        .map(|l| strip_indent(l, indent))
        .collect::<Vec<_>>()
        .join("\n");
    out.push('\n');
    out
}

/// Drop leading whitespace characters that start within the first `indent`
/// bytes. Never cuts inside a character.
fn strip_indent(line: &str, indent: usize) -> &str {
    let cut = line
        .char_indices()
        .take_while(|(i, c)| *i < indent && c.is_whitespace())
        .last()
        .map_or(0, |(i, c)| i + c.len_utf8());
    &line[cut..]
}

fn parse_mapping(body: &str) -> Result<serde_json::Map<String, serde_json::Value>, String> {
    let yaml: serde_yaml::Value =
        serde_yaml::from_str(&dedent(body)).map_err(|e| format!("invalid block syntax: {e}"))?;
    match serde_json::to_value(yaml) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err("block is not a key/value mapping".into()),
        Err(e) => Err(format!("unsupported block content: {e}")),
    }
}

impl ToolArguments {
    /// Resolve to a key/value mapping.
    ///
    /// Raw text is tried as JSON first, then as block mapping notation.
    pub fn resolve(&self) -> Result<serde_json::Map<String, serde_json::Value>, String> {
        match self {
            ToolArguments::Structured(map) => Ok(map.clone()),
            ToolArguments::Raw(raw) if raw.trim().is_empty() => Ok(serde_json::Map::new()),
            ToolArguments::Raw(raw) => match serde_json::from_str::<serde_json::Value>(raw) {
                Ok(serde_json::Value::Object(map)) => Ok(map),
                _ => parse_mapping(raw),
            },
        }
    }
}

fn parse_tool_call(body: &str) -> Result<ToolCall, String> {
    let mut map = parse_mapping(body)?;
    let name = match map.remove("name") {
        Some(serde_json::Value::String(name)) if !name.trim().is_empty() => name.trim().to_string(),
        Some(_) => return Err("'name' must be a non-empty string".into()),
        None => return Err("missing 'name'".into()),
    };
    let arguments = match map.remove("arguments") {
        Some(serde_json::Value::Object(args)) => ToolArguments::Structured(args),
        Some(serde_json::Value::Null) => ToolArguments::default(),
        Some(serde_json::Value::String(raw)) => ToolArguments::Raw(raw),
        Some(other) => ToolArguments::Raw(other.to_string()),
        None => return Err(format!("missing 'arguments' for tool '{name}'")),
    };
    Ok(ToolCall { name, arguments })
}

fn parse_send_message(body: &str) -> Result<RoutedMessage, String> {
    let map = parse_mapping(body)?;
    let field = |key: &str| -> Result<String, String> {
        match map.get(key) {
            Some(serde_json::Value::String(s)) => Ok(s.trim_end().to_string()),
            Some(serde_json::Value::Null) | None => Err(format!("missing '{key}'")),
            Some(other) => Ok(other.to_string()),
        }
    };
    Ok(RoutedMessage {
        to: field("to")?.trim().to_string(),
        content: field("content")?,
    })
}

fn parse_patch(body: &str) -> Result<PatchBlock, String> {
    let mut file = None;
    let mut reason = String::new();
    let mut rest = Vec::new();

    for line in body.lines() {
        let trimmed = line.trim();
        if file.is_none() && trimmed.starts_with("File:") {
            file = Some(trimmed["File:".len()..].trim().to_string());
        } else if reason.is_empty() && trimmed.starts_with("Reason:") {
            reason = trimmed["Reason:".len()..].trim().to_string();
        } else {
            rest.push(line);
        }
    }

    let file = file
        .filter(|f| !f.is_empty())
        .ok_or_else(|| "missing 'File:' line".to_string())?;
    let body = parse_patch_body(&rest)?;
    Ok(PatchBlock { file, reason, body })
}

fn parse_patch_body(lines: &[&str]) -> Result<PatchBody, String> {
    let search_start = lines.iter().position(|l| l.trim_start().starts_with("<<<<<<< SEARCH"));
    if let Some(start) = search_start {
        let divider = lines[start..]
            .iter()
            .position(|l| l.trim() == "=======")
            .map(|i| i + start)
            .ok_or_else(|| "SEARCH section without '=======' divider".to_string())?;
        let end = lines[divider..]
            .iter()
            .position(|l| l.trim_start().starts_with(">>>>>>> REPLACE"))
            .map(|i| i + divider)
            .ok_or_else(|| "SEARCH section without '>>>>>>> REPLACE' terminator".to_string())?;
        let search = lines[start + 1..divider].join("\n");
        if search.is_empty() {
            return Err("empty SEARCH section".into());
        }
        return Ok(PatchBody::SearchReplace {
            search,
            replace: lines[divider + 1..end].join("\n"),
        });
    }

    let fence_start = lines
        .iter()
        .position(|l| l.trim_start().starts_with("```"))
        .ok_or_else(|| "missing code fence or SEARCH/REPLACE section".to_string())?;
    let fence_end = lines[fence_start + 1..]
        .iter()
        .rposition(|l| l.trim_start().starts_with("```"))
        .map(|i| i + fence_start + 1)
        .unwrap_or(lines.len());
    let mut content = lines[fence_start + 1..fence_end].join("\n");
    content.push('\n');
    Ok(PatchBody::FullContent(content))
}
