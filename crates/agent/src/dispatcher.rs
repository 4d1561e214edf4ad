//! Tool dispatcher, the `TOOL_CALL` output handler.
//!
//! Owns the tool registry, runs exactly one tool call per response, and keeps
//! oversized reports inside the context window by summarizing their tail.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use turnstile_core::action::{ActionKind, ParsedResponse, TOOL_CALL_TAG, ToolCall};
use turnstile_core::error::Result;
use turnstile_core::event::{DomainEvent, EventBus};
use turnstile_core::handler::{HandlerOutcome, OutputHandler};
use turnstile_core::model::ModelService;
use turnstile_core::tool::{ToolOutput, ToolRegistry};

use crate::context::token::{TokenBudget, estimate_tokens, tail_tokens};

const PREVIEW_CHARS: usize = 300;

const TOOL_CALL_HELP: &str = r#"# Tool call format
<TOOL_CALL>
name: tool_name
arguments:
    param1: value1
    param2: value2
</TOOL_CALL>

# Rules
1. One tool per response. Wait for its result before the next step.
2. Follow the format exactly, with YAML indentation and every required parameter.
3. Never assume or invent a tool result.
4. Use the | block syntax for string parameters:

<TOOL_CALL>
name: execute_shell
arguments:
    command: |
        git status --porcelain
</TOOL_CALL>
"#;

pub struct ToolDispatcher {
    registry: ToolRegistry,
    budget: TokenBudget,
    summarizer: Option<Arc<dyn ModelService>>,
    event_bus: Option<Arc<EventBus>>,
}

impl ToolDispatcher {
    pub fn new(registry: ToolRegistry, max_token_count: usize) -> Self {
        Self {
            registry,
            budget: TokenBudget::new(max_token_count),
            summarizer: None,
            event_bus: None,
        }
    }

    /// Model used to condense oversized tool output. It is reset after
    /// every summary, so it should not be an agent's own session.
    pub fn with_summarizer(mut self, model: Arc<dyn ModelService>) -> Self {
        self.summarizer = Some(model);
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Restrict the dispatcher to `names`. Unknown names are logged.
    pub fn use_tools(&mut self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        for missing in self.registry.retain_only(names) {
            warn!(tool = %missing, "Requested tool is not registered");
        }
    }

    pub fn dont_use_tools(&mut self, names: &[String]) {
        self.registry.remove_all(names);
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.registry.names()
    }

    /// Run one call and render its report.
    pub async fn execute_call(&self, call: &ToolCall) -> String {
        if !self.registry.contains(&call.name) {
            warn!(tool = %call.name, "Model called an unknown tool");
            return render_report(&ToolOutput::failure(format!(
                "Tool {} does not exist, available tools: {}",
                call.name,
                self.registry.names().join(", ")
            )));
        }

        let arguments = match call.arguments.resolve() {
            Ok(map) => serde_json::Value::Object(map),
            Err(reason) => {
                warn!(tool = %call.name, %reason, "Tool arguments could not be parsed");
                return format!(
                    "Invalid arguments for tool {}: {reason}\nThe tool was not executed.\n\n{TOOL_CALL_HELP}",
                    call.name
                );
            }
        };

        info!(tool = %call.name, "Executing tool");
        debug!(tool = %call.name, %arguments, "Tool arguments");
        let started = Instant::now();
        let output = match self.registry.execute(&call.name, arguments).await {
            Ok(output) => output,
            Err(e) => ToolOutput::failure(e.to_string()),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        if output.success {
            debug!(tool = %call.name, duration_ms, "Tool succeeded");
        } else {
            warn!(tool = %call.name, duration_ms, stderr = %output.stderr, "Tool failed");
        }
        if let Some(bus) = &self.event_bus {
            bus.publish(DomainEvent::ToolExecuted {
                tool_name: call.name.clone(),
                success: output.success,
                duration_ms,
                timestamp: Utc::now(),
            });
        }

        let report = render_report(&output);
        if self.budget.fits_tool_output(&report) {
            report
        } else {
            self.shrink(&call.name, report).await
        }
    }

    /// Condense a report that does not fit the tool-output budget.
    async fn shrink(&self, tool: &str, report: String) -> String {
        let budget = self.budget.tool_output_budget();
        let tokens = estimate_tokens(&report);
        info!(tool, tokens, budget, "Tool output over budget, summarizing");

        let Some(model) = &self.summarizer else {
            return too_long_notice(&report);
        };

        let tail = tail_tokens(&report, budget);
        let truncated = if tail.len() < report.len() {
            format!("\n(The output was too long; only its last {budget} tokens were summarized.)")
        } else {
            String::new()
        };
        let request = format!(
            "Summarize the result of the tool below and extract the key information.\n\
             1. Keep every important number, path and error message.\n\
             2. Stay accurate to the output.\n\
             3. Describe the main content concisely.\n\
             4. If there are errors, include them.\n\n\
             Tool: {tool}\nOutput:\n{tail}\n\nSummary:"
        );

        let summary = model.chat(&request).await;
        model.reset().await;
        match summary {
            Ok(summary) => format!(
                "--- Original output was too long; summary follows ---{truncated}\n\n{summary}\n\n--- End of summary ---"
            ),
            Err(e) => {
                warn!(tool, error = %e, "Summarizing tool output failed");
                too_long_notice(&report)
            }
        }
    }
}

/// `stdout`/`stderr` sections, or a placeholder when both are empty.
pub fn render_report(output: &ToolOutput) -> String {
    let mut parts = Vec::new();
    if !output.stdout.is_empty() {
        parts.push(format!("stdout:\n{}", output.stdout));
    }
    if !output.stderr.is_empty() {
        parts.push(format!("stderr:\n{}", output.stderr));
    }
    if parts.is_empty() {
        "no output".to_string()
    } else {
        parts.join("\n\n")
    }
}

fn too_long_notice(report: &str) -> String {
    let preview: String = report.chars().take(PREVIEW_CHARS).collect();
    format!(
        "output too long ({} characters); check the raw output instead.\nFirst {PREVIEW_CHARS} characters:\n{preview}...",
        report.chars().count()
    )
}

#[async_trait]
impl OutputHandler for ToolDispatcher {
    fn name(&self) -> &str {
        TOOL_CALL_TAG
    }

    fn can_handle(&self, response: &ParsedResponse) -> bool {
        response.count(ActionKind::ToolCall) > 0
            || response.malformed(ActionKind::ToolCall).next().is_some()
    }

    async fn handle(&self, response: &ParsedResponse) -> Result<HandlerOutcome> {
        let calls = response.tool_calls();

        if calls.len() > 1 {
            let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
            warn!(tools = %names.join(", "), "Multiple tool calls in one response, none executed");
            return Ok(HandlerOutcome::Continue(format!(
                "Call failed: {} tool calls were sent ({}). Nothing was executed. \
                 Please ONLY handle one tool call at a time.",
                calls.len(),
                names.join(", ")
            )));
        }

        let Some(call) = calls.first() else {
            let reasons: Vec<String> = response
                .malformed(ActionKind::ToolCall)
                .map(|m| format!("- {}", m.reason))
                .collect();
            return Ok(HandlerOutcome::Continue(format!(
                "Tool call format error:\n{}\n\n{TOOL_CALL_HELP}",
                reasons.join("\n")
            )));
        };

        Ok(HandlerOutcome::Continue(self.execute_call(call).await))
    }

    fn prompt(&self) -> String {
        let definitions = self.registry.definitions();
        if definitions.is_empty() {
            return String::new();
        }
        let mut prompt = String::from("Available tools:\n");
        for def in definitions {
            prompt.push_str(&format!(
                "- Name: {}\n  Description: {}\n  Parameters: {}\n",
                def.name, def.description, def.parameters
            ));
        }
        prompt.push('\n');
        prompt.push_str(TOOL_CALL_HELP);
        prompt
    }
}
