//! Memory tools: save and retrieve notes across tasks.
//!
//! Three kinds of memory are kept:
//! - `short_term`: lives only as long as the process
//! - `project_long_term`: JSON lines under the project directory
//! - `global_long_term`: JSON lines under the user's config directory
//!
//! Long-term stores are append-only files with one JSON-encoded
//! [`MemoryEntry`] per line. Corrupted lines are skipped with a warning.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use turnstile_core::error::ToolError;
use turnstile_core::tool::{Tool, ToolOutput};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    ShortTerm,
    ProjectLongTerm,
    GlobalLongTerm,
}

impl MemoryType {
    pub const ALL: [MemoryType; 3] = [
        MemoryType::ProjectLongTerm,
        MemoryType::GlobalLongTerm,
        MemoryType::ShortTerm,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MemoryType::ShortTerm => "short_term",
            MemoryType::ProjectLongTerm => "project_long_term",
            MemoryType::GlobalLongTerm => "global_long_term",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "short_term" => Some(MemoryType::ShortTerm),
            "project_long_term" => Some(MemoryType::ProjectLongTerm),
            "global_long_term" => Some(MemoryType::GlobalLongTerm),
            _ => None,
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    #[serde(default)]
    pub tags: Vec<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Shared memory store backing both memory tools.
pub struct MemoryStore {
    project_file: PathBuf,
    global_file: PathBuf,
    short_term: RwLock<Vec<MemoryEntry>>,
}

impl MemoryStore {
    /// `project_dir` holds project memories, `global_dir` holds global ones.
    pub fn new(project_dir: impl AsRef<Path>, global_dir: impl AsRef<Path>) -> Self {
        Self {
            project_file: project_dir.as_ref().join("project_long_term.jsonl"),
            global_file: global_dir.as_ref().join("global_long_term.jsonl"),
            short_term: RwLock::new(Vec::new()),
        }
    }

    fn file_for(&self, memory_type: MemoryType) -> Option<&Path> {
        match memory_type {
            MemoryType::ShortTerm => None,
            MemoryType::ProjectLongTerm => Some(&self.project_file),
            MemoryType::GlobalLongTerm => Some(&self.global_file),
        }
    }

    pub async fn save(
        &self,
        memory_type: MemoryType,
        tags: Vec<String>,
        content: impl Into<String>,
    ) -> std::io::Result<MemoryEntry> {
        let entry = MemoryEntry {
            id: Uuid::new_v4().to_string(),
            memory_type,
            tags,
            content: content.into(),
            created_at: Utc::now(),
        };

        match self.file_for(memory_type) {
            None => self.short_term.write().await.push(entry.clone()),
            Some(path) => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let mut line = serde_json::to_string(&entry)?;
                line.push('\n');
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await?;
                file.write_all(line.as_bytes()).await?;
                file.flush().await?;
            }
        }

        debug!(memory_type = %memory_type, id = %entry.id, "Memory saved");
        Ok(entry)
    }

    async fn load(&self, memory_type: MemoryType) -> Vec<MemoryEntry> {
        let Some(path) = self.file_for(memory_type) else {
            return self.short_term.read().await.clone();
        };
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<MemoryEntry>(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "Skipping corrupted memory entry");
                    None
                }
            })
            .collect()
    }

    /// Memories of the given types carrying any of `tags` (all when `tags` is
    /// empty), newest first.
    pub async fn retrieve(
        &self,
        types: &[MemoryType],
        tags: &[String],
        limit: Option<usize>,
    ) -> Vec<MemoryEntry> {
        let mut found = Vec::new();
        for memory_type in types {
            found.extend(
                self.load(*memory_type)
                    .await
                    .into_iter()
                    .filter(|e| tags.is_empty() || e.tags.iter().any(|t| tags.contains(t))),
            );
        }
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            found.truncate(limit);
        }
        found
    }

    /// Every tag in use, grouped by memory type.
    pub async fn tags(&self) -> BTreeMap<MemoryType, BTreeSet<String>> {
        let mut out = BTreeMap::new();
        for memory_type in MemoryType::ALL {
            let tags: BTreeSet<String> = self
                .load(memory_type)
                .await
                .into_iter()
                .flat_map(|e| e.tags)
                .collect();
            if !tags.is_empty() {
                out.insert(memory_type, tags);
            }
        }
        out
    }
}

fn string_list(value: &serde_json::Value) -> Vec<String> {
    match value {
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        serde_json::Value::String(s) => vec![s.clone()],
        _ => Vec::new(),
    }
}

pub struct SaveMemoryTool {
    store: Arc<MemoryStore>,
}

impl SaveMemoryTool {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for SaveMemoryTool {
    fn name(&self) -> &str {
        "save_memory"
    }

    fn description(&self) -> &str {
        "Save a piece of information for later retrieval. memory_type is one of project_long_term (facts about this project), global_long_term (general knowledge, user preferences, methods) or short_term (scratch notes for the current task). Tag memories so they can be found again."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "memory_type": {
                    "type": "string",
                    "enum": ["project_long_term", "global_long_term", "short_term"],
                    "description": "Where to keep the memory"
                },
                "tags": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Tags used to find the memory later"
                },
                "content": {
                    "type": "string",
                    "description": "What to remember"
                }
            },
            "required": ["memory_type", "content"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let memory_type = arguments["memory_type"]
            .as_str()
            .and_then(MemoryType::parse)
            .ok_or_else(|| {
                ToolError::InvalidArguments(
                    "'memory_type' must be project_long_term, global_long_term or short_term".into(),
                )
            })?;
        let content = arguments["content"]
            .as_str()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'content' argument".into()))?;
        let tags = string_list(&arguments["tags"]);

        match self.store.save(memory_type, tags, content).await {
            Ok(entry) => Ok(ToolOutput::ok(format!(
                "Saved {} memory {} with tags [{}]",
                entry.memory_type,
                entry.id,
                entry.tags.join(", ")
            ))),
            Err(e) => Err(ToolError::ExecutionFailed {
                tool_name: "save_memory".into(),
                reason: e.to_string(),
            }),
        }
    }
}

pub struct RetrieveMemoryTool {
    store: Arc<MemoryStore>,
}

impl RetrieveMemoryTool {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for RetrieveMemoryTool {
    fn name(&self) -> &str {
        "retrieve_memory"
    }

    fn description(&self) -> &str {
        "Retrieve saved memories by type, optionally filtered by tags (a memory matches if it has any of the tags). Use 'all' to search every type. Results are newest first."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "memory_types": {
                    "type": "array",
                    "items": {
                        "type": "string",
                        "enum": ["project_long_term", "global_long_term", "short_term", "all"]
                    },
                    "description": "Memory types to search"
                },
                "tags": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Only return memories with any of these tags (optional)"
                },
                "limit": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Maximum number of memories to return (optional)"
                }
            },
            "required": ["memory_types"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let requested = string_list(&arguments["memory_types"]);
        let types: Vec<MemoryType> = if requested.iter().any(|t| t == "all") {
            MemoryType::ALL.to_vec()
        } else {
            requested
                .iter()
                .map(|t| {
                    MemoryType::parse(t).ok_or_else(|| {
                        ToolError::InvalidArguments(format!("unknown memory type '{t}'"))
                    })
                })
                .collect::<Result<_, _>>()?
        };
        if types.is_empty() {
            return Err(ToolError::InvalidArguments("Missing 'memory_types' argument".into()));
        }

        let tags = string_list(&arguments["tags"]);
        let limit = arguments["limit"].as_u64().map(|l| l as usize);
        let memories = self.store.retrieve(&types, &tags, limit).await;

        let report = serde_json::json!({
            "total_count": memories.len(),
            "memory_types": types,
            "filter_tags": tags,
            "memories": memories,
        });
        let text = serde_json::to_string_pretty(&report).map_err(|e| ToolError::ExecutionFailed {
            tool_name: "retrieve_memory".into(),
            reason: e.to_string(),
        })?;
        Ok(ToolOutput::ok(text))
    }
}
