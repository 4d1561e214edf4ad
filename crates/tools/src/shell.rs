//! Shell tool: execute system commands.
//!
//! Supports command allowlisting.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};
use turnstile_core::error::ToolError;
use turnstile_core::tool::{Tool, ToolOutput};

/// Execute shell commands with safety constraints.
pub struct ShellTool {
    /// If non-empty, only these commands are allowed.
    allowed_commands: Vec<String>,
}

impl ShellTool {
    pub fn new(allowed_commands: Vec<String>) -> Self {
        Self { allowed_commands }
    }

    fn is_command_allowed(&self, command: &str) -> bool {
        if self.allowed_commands.is_empty() {
            return true;
        }

        // Command substitution can hide any program.
        if command.contains("$(") || command.contains('`') {
            return false;
        }

        // Every command of every script line must be an allowed base command.
        command
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .flat_map(command_segments)
            .all(|segment| {
                let base_cmd = segment.split_whitespace().next().unwrap_or("");
                self.allowed_commands.iter().any(|a| a == base_cmd)
            })
    }
}

/// Split a line at `;`, `|`, `||`, `&` and `&&`. Redirections like `2>&1`
/// are not separators.
fn command_segments(line: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut prev = '\0';
    for (i, c) in line.char_indices() {
        let separator = matches!(c, ';' | '|') || (c == '&' && !matches!(prev, '>' | '<'));
        if separator {
            segments.push(&line[start..i]);
            start = i + c.len_utf8();
        }
        prev = c;
    }
    segments.push(&line[start..]);
    segments
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "execute_shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command or short script and return its stdout and stderr. Use this for running programs, inspecting files, git operations, etc."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command or script to execute"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let command = arguments["command"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'command' argument".into()))?;

        if !self.is_command_allowed(command) {
            return Err(ToolError::PermissionDenied {
                tool_name: "execute_shell".into(),
                reason: format!(
                    "Command '{}' not in allowlist",
                    command.split_whitespace().next().unwrap_or("")
                ),
            });
        }

        debug!(command = %command, "Executing shell command");

        let output = if cfg!(target_os = "windows") {
            Command::new("cmd").args(["/C", command]).output().await
        } else {
            Command::new("sh").args(["-c", command]).output().await
        };

        match output {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
                let mut stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
                let success = output.status.success();

                if !success {
                    let code = output.status.code().unwrap_or(-1);
                    warn!(command = %command, exit_code = code, "Command failed");
                    if !stderr.is_empty() {
                        stderr.push('\n');
                    }
                    stderr.push_str(&format!("[exit code: {code}]"));
                }

                Ok(ToolOutput {
                    success,
                    stdout,
                    stderr,
                })
            }
            Err(e) => Err(ToolError::ExecutionFailed {
                tool_name: "execute_shell".into(),
                reason: e.to_string(),
            }),
        }
    }
}
