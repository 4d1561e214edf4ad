//! File read tool: read file contents, optionally a line range.

use async_trait::async_trait;
use turnstile_core::error::ToolError;
use turnstile_core::tool::{Tool, ToolOutput};

#[derive(Default)]
pub struct FileReadTool;

impl FileReadTool {
    pub fn new() -> Self {
        Self
    }
}

/// Lines `start..=end` (1-based), each prefixed with its line number.
fn select_lines(content: &str, start: Option<u64>, end: Option<u64>) -> String {
    let start = start.unwrap_or(1).max(1) as usize;
    let end = end.map(|e| e as usize).unwrap_or(usize::MAX);
    content
        .lines()
        .enumerate()
        .skip(start - 1)
        .take_while(|(i, _)| *i < end)
        .map(|(i, line)| format!("{:>4} | {line}", i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl Tool for FileReadTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file. Optionally restrict to a 1-based inclusive line range; ranged output is prefixed with line numbers."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to read"
                },
                "start_line": {
                    "type": "integer",
                    "description": "First line to return (1-based, optional)"
                },
                "end_line": {
                    "type": "integer",
                    "description": "Last line to return (inclusive, optional)"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let path = arguments["path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'path' argument".into()))?;
        let start = arguments["start_line"].as_u64();
        let end = arguments["end_line"].as_u64();

        match tokio::fs::read_to_string(path).await {
            Ok(content) if start.is_none() && end.is_none() => Ok(ToolOutput::ok(content)),
            Ok(content) => Ok(ToolOutput::ok(select_lines(&content, start, end))),
            Err(e) => Ok(ToolOutput::failure(format!("Failed to read file: {e}"))),
        }
    }
}
