//! External tools described by TOML command manifests.
//!
//! Each `*.toml` file in the tools directory describes one command:
//!
//! ```toml
//! name = "word_count"
//! description = "Count words in a text"
//! command = "wc"
//! args = ["-w"]
//! requires = ["wc"]
//!
//! [parameters.text]
//! type = "string"
//! description = "Text to count"
//! required = true
//! ```
//!
//! The call arguments are written to the command's stdin as JSON and also
//! exported as `TURNSTILE_ARG_<NAME>` environment variables.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};
use turnstile_core::error::ToolError;
use turnstile_core::tool::{Tool, ToolOutput};

#[derive(Debug, Clone, Deserialize)]
pub struct ParameterSpec {
    #[serde(rename = "type", default = "default_param_type")]
    pub param_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

fn default_param_type() -> String {
    "string".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandManifest {
    pub name: String,
    pub description: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Binaries that must be on PATH for the tool to be offered
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterSpec>,
}

/// A tool backed by an external command.
pub struct CommandTool {
    manifest: CommandManifest,
    origin: PathBuf,
}

impl CommandTool {
    pub fn new(manifest: CommandManifest, origin: impl Into<PathBuf>) -> Self {
        Self {
            manifest,
            origin: origin.into(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ToolError> {
        let content = std::fs::read_to_string(path).map_err(|e| ToolError::LoadFailed {
            origin: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let manifest: CommandManifest =
            toml::from_str(&content).map_err(|e| ToolError::LoadFailed {
                origin: path.display().to_string(),
                reason: e.to_string(),
            })?;
        if manifest.name.trim().is_empty() || manifest.command.trim().is_empty() {
            return Err(ToolError::LoadFailed {
                origin: path.display().to_string(),
                reason: "'name' and 'command' must not be empty".into(),
            });
        }
        Ok(Self::new(manifest, path))
    }

    pub fn origin(&self) -> &Path {
        &self.origin
    }
}

fn env_key(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("TURNSTILE_ARG_{cleaned}")
}

fn on_path(binary: &str) -> bool {
    if binary.contains(std::path::MAIN_SEPARATOR) {
        return Path::new(binary).is_file();
    }
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| {
        let candidate = dir.join(binary);
        candidate.is_file() || (cfg!(windows) && candidate.with_extension("exe").is_file())
    })
}

#[async_trait]
impl Tool for CommandTool {
    fn name(&self) -> &str {
        &self.manifest.name
    }

    fn description(&self) -> &str {
        &self.manifest.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        let properties: serde_json::Map<String, serde_json::Value> = self
            .manifest
            .parameters
            .iter()
            .map(|(name, spec)| {
                (
                    name.clone(),
                    serde_json::json!({
                        "type": spec.param_type,
                        "description": spec.description,
                    }),
                )
            })
            .collect();
        let required: Vec<&String> = self
            .manifest
            .parameters
            .iter()
            .filter(|(_, spec)| spec.required)
            .map(|(name, _)| name)
            .collect();
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    fn check(&self) -> bool {
        self.manifest.requires.iter().all(|bin| on_path(bin))
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        for (name, spec) in &self.manifest.parameters {
            if spec.required && arguments.get(name).is_none_or(|v| v.is_null()) {
                return Err(ToolError::InvalidArguments(format!(
                    "Missing '{name}' argument"
                )));
            }
        }

        let mut command = Command::new(&self.manifest.command);
        command
            .args(&self.manifest.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(map) = arguments.as_object() {
            for (key, value) in map {
                let text = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                command.env(env_key(key), text);
            }
        }

        debug!(tool = %self.manifest.name, command = %self.manifest.command, "Running external tool");

        let failed = |e: std::io::Error| ToolError::ExecutionFailed {
            tool_name: self.manifest.name.clone(),
            reason: e.to_string(),
        };
        let mut child = command.spawn().map_err(failed)?;
        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(&arguments).map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
            // A command that ignores stdin may close it early.
            if let Err(e) = stdin.write_all(&payload).await {
                debug!(tool = %self.manifest.name, error = %e, "stdin not consumed");
            }
        }
        let output = child.wait_with_output().await.map_err(failed)?;

        Ok(ToolOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
        })
    }
}

/// Load every manifest in `dir`. Broken manifests and tools whose `check`
/// fails are logged and skipped.
pub fn load_external_tools(dir: &Path) -> Vec<Box<dyn Tool>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => {
            debug!(dir = %dir.display(), "No external tools directory");
            return Vec::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    paths.sort();

    let mut tools: Vec<Box<dyn Tool>> = Vec::new();
    for path in paths {
        match CommandTool::from_file(&path) {
            Ok(tool) if tool.check() => {
                info!(tool = %tool.name(), origin = %path.display(), "Loaded external tool");
                tools.push(Box::new(tool));
            }
            Ok(tool) => {
                warn!(tool = %tool.name(), origin = %path.display(), "External tool check failed, skipping");
            }
            Err(e) => warn!(error = %e, "Skipping external tool"),
        }
    }
    tools
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, file: &str, body: &str) -> PathBuf {
        let path = dir.join(file);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn env_key_is_uppercased_and_sanitized() {
        assert_eq!(env_key("file-path"), "TURNSTILE_ARG_FILE_PATH");
        assert_eq!(env_key("text"), "TURNSTILE_ARG_TEXT");
    }

    #[test]
    fn schema_lists_required_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "greet.toml",
            r#"
name = "greet"
description = "Say hello"
command = "echo"

[parameters.who]
description = "Person to greet"
required = true

[parameters.loud]
type = "boolean"
"#,
        );
        let tool = CommandTool::from_file(&path).unwrap();
        let schema = tool.parameters_schema();
        assert_eq!(schema["required"], serde_json::json!(["who"]));
        assert_eq!(schema["properties"]["loud"]["type"], "boolean");
        assert_eq!(schema["properties"]["who"]["type"], "string");
    }

    #[test]
    fn missing_requirement_fails_check() {
        let manifest = CommandManifest {
            name: "ghost".into(),
            description: String::new(),
            command: "ghost".into(),
            args: vec![],
            requires: vec!["definitely-not-installed-binary-4242".into()],
            parameters: BTreeMap::new(),
        };
        assert!(!CommandTool::new(manifest, "inline").check());
    }

    #[test]
    fn loader_skips_broken_and_unavailable_tools() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "good.toml", "name = \"good\"\ndescription = \"ok\"\ncommand = \"true\"\n");
        write(dir.path(), "broken.toml", "name = [\n");
        write(
            dir.path(),
            "missing.toml",
            "name = \"missing\"\ndescription = \"x\"\ncommand = \"x\"\nrequires = [\"definitely-not-installed-binary-4242\"]\n",
        );
        write(dir.path(), "notes.txt", "ignored");

        let tools = load_external_tools(dir.path());
        let names: Vec<&str> = tools.iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["good"]);
    }

    #[test]
    fn missing_directory_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_external_tools(&dir.path().join("absent")).is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn arguments_reach_the_command() {
        let manifest = CommandManifest {
            name: "show".into(),
            description: String::new(),
            command: "sh".into(),
            args: vec!["-c".into(), "echo \"$TURNSTILE_ARG_WHO\"; cat".into()],
            requires: vec![],
            parameters: BTreeMap::from([(
                "who".to_string(),
                ParameterSpec {
                    param_type: "string".into(),
                    description: String::new(),
                    required: true,
                },
            )]),
        };
        let tool = CommandTool::new(manifest, "inline");

        let output = tool.execute(serde_json::json!({"who": "ada"})).await.unwrap();
        assert!(output.success);
        let mut lines = output.stdout.lines();
        assert_eq!(lines.next(), Some("ada"));
        assert_eq!(lines.next(), Some(r#"{"who":"ada"}"#));
    }

    #[tokio::test]
    async fn missing_required_argument_is_rejected() {
        let manifest = CommandManifest {
            name: "needs".into(),
            description: String::new(),
            command: "true".into(),
            args: vec![],
            requires: vec![],
            parameters: BTreeMap::from([(
                "x".to_string(),
                ParameterSpec {
                    param_type: "string".into(),
                    description: String::new(),
                    required: true,
                },
            )]),
        };
        let err = CommandTool::new(manifest, "inline")
            .execute(serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
