//! Configuration loading, validation, and management for Turnstile.
//!
//! Loads configuration from `~/.turnstile/config.toml` with environment
//! variable overrides. Validates all settings at startup.
//!
//! Multi-agent setups are described separately by a [`MultiAgentConfig`]
//! file, written in TOML or YAML.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.turnstile/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Model endpoint and context window
    #[serde(default)]
    pub model: ModelConfig,

    /// Agent loop behaviour
    #[serde(default)]
    pub agent: AgentSettings,

    /// Tool selection and external tool discovery
    #[serde(default)]
    pub tools: ToolsConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Base URL of an OpenAI-compatible API (without `/chat/completions`)
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Context window size in tokens; drives compaction and the tool output budget
    #[serde(default = "default_max_token_count")]
    pub max_token_count: usize,

    /// Retries for transient failures before a chat call gives up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_max_token_count() -> usize {
    131_072
}
fn default_max_retries() -> u32 {
    5
}
fn default_temperature() -> f32 {
    0.7
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key: None,
            max_token_count: default_max_token_count(),
            max_retries: default_max_retries(),
            temperature: default_temperature(),
        }
    }
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &redact(&self.api_key))
            .field("max_token_count", &self.max_token_count)
            .field("max_retries", &self.max_retries)
            .field("temperature", &self.temperature)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Finish without asking the user when the model emits the completion marker
    #[serde(default)]
    pub auto_complete: bool,

    /// Produce a final summary when a run completes
    #[serde(default = "default_true")]
    pub need_summary: bool,

    /// Prime the first turn with stored methodologies
    #[serde(default = "default_true")]
    pub use_methodology: bool,

    /// Run the self-analysis pass on completion
    #[serde(default = "default_true")]
    pub use_analysis: bool,

    /// Ask before any handler acts
    #[serde(default)]
    pub execute_tool_confirm: bool,

    /// Ask before a patch is written to disk
    #[serde(default)]
    pub confirm_before_apply_patch: bool,

    /// Replaces the built-in final summary request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_prompt: Option<String>,

    #[serde(default = "default_max_analysis_rounds")]
    pub max_analysis_rounds: u32,

    /// Upper bound on messages relayed between agents in one multi-agent run
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,
}

fn default_true() -> bool {
    true
}
fn default_max_analysis_rounds() -> u32 {
    10
}
fn default_max_hops() -> u32 {
    50
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            auto_complete: false,
            need_summary: true,
            use_methodology: true,
            use_analysis: true,
            execute_tool_confirm: false,
            confirm_before_apply_patch: false,
            summary_prompt: None,
            max_analysis_rounds: default_max_analysis_rounds(),
            max_hops: default_max_hops(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// If non-empty, only these tools are offered to the model
    #[serde(default)]
    pub use_tools: Vec<String>,

    /// Tools removed after `use_tools` is applied
    #[serde(default)]
    pub dont_use_tools: Vec<String>,

    /// Directory of `*.toml` command manifests; defaults to `~/.turnstile/tools`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_dir: Option<PathBuf>,

    /// If non-empty, `execute_shell` only runs these base commands
    #[serde(default)]
    pub shell_allowlist: Vec<String>,

    /// Where the memory tools keep their store; defaults to `~/.turnstile/memory`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Load configuration from the default path (~/.turnstile/config.toml).
    ///
    /// Environment variables override the file:
    /// - `TURNSTILE_API_KEY` (highest priority), then `OPENAI_API_KEY`
    /// - `TURNSTILE_MODEL`
    /// - `TURNSTILE_BASE_URL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(key) = var("TURNSTILE_API_KEY") {
            self.model.api_key = Some(key);
        } else if self.model.api_key.is_none() {
            self.model.api_key = var("OPENAI_API_KEY");
        }

        if let Some(model) = var("TURNSTILE_MODEL") {
            self.model.model = model;
        }

        if let Some(url) = var("TURNSTILE_BASE_URL") {
            self.model.base_url = url;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".turnstile")
    }

    /// Directory scanned for external tool manifests.
    pub fn external_tools_dir(&self) -> PathBuf {
        self.tools
            .external_dir
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("tools"))
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.tools
            .memory_dir
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("memory"))
    }

    /// Path of the methodology store used to prime first turns.
    pub fn methodology_path() -> PathBuf {
        Self::config_dir().join("methodology.yaml")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.temperature < 0.0 || self.model.temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "model.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.model.max_token_count < 1024 {
            return Err(ConfigError::ValidationError(
                "model.max_token_count must be at least 1024".into(),
            ));
        }

        if self.model.base_url.trim().is_empty() {
            return Err(ConfigError::ValidationError("model.base_url must not be empty".into()));
        }

        if self.agent.max_hops == 0 {
            return Err(ConfigError::ValidationError("agent.max_hops must be > 0".into()));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.model.api_key.is_some()
    }

    /// Generate a default config TOML string (for the `init` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// A set of cooperating agents, one of which receives the user's input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiAgentConfig {
    pub main_agent: String,

    #[serde(default)]
    pub agents: Vec<AgentProfile>,
}

/// One agent inside a [`MultiAgentConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub name: String,

    /// Shown to the other agents so they know whom to address
    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub system_prompt: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_prompt: Option<String>,

    #[serde(default)]
    pub auto_complete: bool,

    #[serde(default)]
    pub execute_tool_confirm: bool,

    /// Overrides `model.model` for this agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Overrides `model.max_token_count` for this agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_token_count: Option<usize>,

    /// Restrict this agent's tools; empty means every available tool
    #[serde(default)]
    pub use_tools: Vec<String>,
}

impl MultiAgentConfig {
    /// Load from a `.yaml`/`.yml` or `.toml` file, chosen by extension.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );

        let config: Self = if is_yaml {
            serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
        } else {
            toml::from_str(&content).map_err(|e| ConfigError::ParseError {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.main_agent.trim().is_empty() {
            return Err(ConfigError::ValidationError("main_agent must be set".into()));
        }

        if self.agents.is_empty() {
            return Err(ConfigError::ValidationError("at least one agent is required".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate agent name '{}'",
                    agent.name
                )));
            }
        }

        if !seen.contains(self.main_agent.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "main_agent '{}' is not one of the configured agents",
                self.main_agent
            )));
        }

        Ok(())
    }
}

fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.model.max_token_count, 131_072);
        assert!(config.agent.need_summary);
        assert!(!config.agent.auto_complete);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.model.model, config.model.model);
        assert_eq!(parsed.agent.max_hops, config.agent.max_hops);
    }

    #[test]
    fn invalid_temperature_rejected() {
        let mut config = AppConfig::default();
        config.model.temperature = 3.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn tiny_context_window_rejected() {
        let mut config = AppConfig::default();
        config.model.max_token_count = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.model.base_url, default_base_url());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[model]\nmax_token_count = 8192\n\n[agent]\nauto_complete = true\n\n[tools]\nuse_tools = [\"read_file\"]\n",
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.model.max_token_count, 8192);
        assert_eq!(config.model.model, default_model());
        assert!(config.agent.auto_complete);
        assert!(config.agent.use_analysis);
        assert_eq!(config.tools.use_tools, vec!["read_file".to_string()]);
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[model\nbroken").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("OPENAI_API_KEY", "sk-openai"),
            ("TURNSTILE_MODEL", "local-model"),
            ("TURNSTILE_BASE_URL", "http://localhost:8080/v1"),
        ]
        .into();
        let mut config = AppConfig::default();
        config.apply_env_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.model.api_key.as_deref(), Some("sk-openai"));
        assert_eq!(config.model.model, "local-model");
        assert_eq!(config.model.base_url, "http://localhost:8080/v1");
    }

    #[test]
    fn turnstile_key_beats_file_key() {
        let mut config = AppConfig::default();
        config.model.api_key = Some("from-file".into());
        config.apply_env_overrides(|k| (k == "TURNSTILE_API_KEY").then(|| "from-env".to_string()));
        assert_eq!(config.model.api_key.as_deref(), Some("from-env"));

        let mut config = AppConfig::default();
        config.model.api_key = Some("from-file".into());
        config.apply_env_overrides(|k| (k == "OPENAI_API_KEY").then(|| "fallback".to_string()));
        assert_eq!(config.model.api_key.as_deref(), Some("from-file"));
    }

    #[test]
    fn debug_redacts_api_key() {
        let mut config = ModelConfig::default();
        config.api_key = Some("sk-secret".into());
        let printed = format!("{config:?}");
        assert!(!printed.contains("sk-secret"));
        assert!(printed.contains("[REDACTED]"));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("[model]"));
        assert!(toml_str.contains("max_token_count"));
    }

    #[test]
    fn multi_agent_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("team.yaml");
        std::fs::write(
            &path,
            r#"
main_agent: planner
agents:
  - name: planner
    description: Breaks work down
    system_prompt: You plan.
  - name: coder
    description: Writes code
    system_prompt: You code.
    auto_complete: true
    use_tools: [read_file, write_file]
"#,
        )
        .unwrap();

        let config = MultiAgentConfig::load_from(&path).unwrap();
        assert_eq!(config.main_agent, "planner");
        assert_eq!(config.agents.len(), 2);
        assert!(config.agents[1].auto_complete);
        assert_eq!(config.agents[1].use_tools.len(), 2);
    }

    #[test]
    fn multi_agent_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("team.toml");
        std::fs::write(
            &path,
            r#"
main_agent = "a"

[[agents]]
name = "a"
description = "first"

[[agents]]
name = "b"
max_token_count = 4096
"#,
        )
        .unwrap();

        let config = MultiAgentConfig::load_from(&path).unwrap();
        assert_eq!(config.agents[1].max_token_count, Some(4096));
    }

    #[test]
    fn multi_agent_main_must_exist() {
        let config = MultiAgentConfig {
            main_agent: "ghost".into(),
            agents: vec![AgentProfile {
                name: "real".into(),
                description: String::new(),
                system_prompt: String::new(),
                summary_prompt: None,
                auto_complete: false,
                execute_tool_confirm: false,
                model: None,
                max_token_count: None,
                use_tools: vec![],
            }],
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn multi_agent_rejects_duplicate_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("team.yml");
        std::fs::write(
            &path,
            "main_agent: a\nagents:\n  - name: a\n  - name: a\n",
        )
        .unwrap();
        assert!(matches!(
            MultiAgentConfig::load_from(&path),
            Err(ConfigError::ValidationError(_))
        ));
    }
}
