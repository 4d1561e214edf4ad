//! Patch applier, an output handler that edits files from `<PATCH>` blocks.
//!
//! A patch either replaces the whole file (fenced body) or swaps one snippet
//! for another (SEARCH/REPLACE body). One patch block per turn.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use turnstile_core::action::{ActionKind, ParsedResponse, PatchBlock, PatchBody};
use turnstile_core::error::Result;
use turnstile_core::handler::{HandlerOutcome, OutputHandler};
use turnstile_core::human::HumanInput;

pub struct PatchApplier {
    root: PathBuf,
    confirm: Option<Arc<dyn HumanInput>>,
}

impl PatchApplier {
    /// Paths in patch blocks are resolved against `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            confirm: None,
        }
    }

    /// Ask the operator before each write.
    pub fn with_confirmation(mut self, human: Arc<dyn HumanInput>) -> Self {
        self.confirm = Some(human);
        self
    }

    /// Resolve `file` against the root. Parent components and anything that
    /// lands outside the root, symlinks included, are rejected.
    fn resolve(&self, file: &str) -> std::result::Result<PathBuf, String> {
        let path = Path::new(file);
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(format!("path traversal detected in '{file}'"));
        }
        let root = self.root.canonicalize().unwrap_or_else(|_| self.root.clone());
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(path)
        };
        let resolved = canonicalize_existing(&joined);
        if !resolved.starts_with(&root) {
            return Err(format!("'{file}' is outside {}", self.root.display()));
        }
        Ok(resolved)
    }

    async fn apply(&self, patch: &PatchBlock) -> std::result::Result<String, String> {
        let path = self.resolve(&patch.file)?;
        let new_content = match &patch.body {
            PatchBody::FullContent(content) => content.clone(),
            PatchBody::SearchReplace { search, replace } => {
                let current = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| format!("cannot read {}: {e}", patch.file))?;
                if !current.contains(search.as_str()) {
                    return Err(format!(
                        "the SEARCH text was not found in {}; copy it exactly from the file",
                        patch.file
                    ));
                }
                current.replacen(search.as_str(), replace, 1)
            }
        };

        if let Ok(existing) = tokio::fs::read_to_string(&path).await
            && existing == new_content
        {
            return Ok(format!("Patch for {} produced no change.", patch.file));
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("cannot create directory for {}: {e}", patch.file))?;
        }
        tokio::fs::write(&path, &new_content)
            .await
            .map_err(|e| format!("cannot write {}: {e}", patch.file))?;

        info!(file = %patch.file, reason = %patch.reason, "Patch applied");
        Ok(format!("Patch applied to {}.", patch.file))
    }
}

/// Canonicalize the longest existing prefix of `path` and re-append the
/// components that do not exist yet.
fn canonicalize_existing(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut missing = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name);
                existing = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
    let mut resolved = existing
        .canonicalize()
        .unwrap_or_else(|_| existing.to_path_buf());
    resolved.extend(missing.iter().rev());
    resolved
}

#[async_trait]
impl OutputHandler for PatchApplier {
    fn name(&self) -> &str {
        "PATCH"
    }

    fn can_handle(&self, response: &ParsedResponse) -> bool {
        response.count(ActionKind::Patch) > 0 || response.malformed(ActionKind::Patch).next().is_some()
    }

    async fn handle(&self, response: &ParsedResponse) -> Result<HandlerOutcome> {
        let patches = response.patches();

        if patches.is_empty() {
            let reasons: Vec<String> = response
                .malformed(ActionKind::Patch)
                .map(|m| format!("- {}", m.reason))
                .collect();
            return Ok(HandlerOutcome::Continue(format!(
                "Patch format error:\n{}\n\n{}",
                reasons.join("\n"),
                self.prompt()
            )));
        }

        if patches.len() > 1 {
            let files: Vec<&str> = patches.iter().map(|p| p.file.as_str()).collect();
            return Ok(HandlerOutcome::Continue(format!(
                "Patch rejected: {} patches were sent ({}). Send ONLY one <PATCH> block per turn.",
                patches.len(),
                files.join(", ")
            )));
        }

        let patch = patches[0];
        if let Some(human) = &self.confirm {
            let question = format!("Apply patch to {}? ({})", patch.file, patch.reason);
            if !human.confirm(&question, true).await {
                return Ok(HandlerOutcome::Continue(format!(
                    "The user declined the patch to {}.",
                    patch.file
                )));
            }
        }

        let text = match self.apply(patch).await {
            Ok(report) => report,
            Err(reason) => {
                warn!(file = %patch.file, %reason, "Patch failed");
                format!("Patch failed: {reason}")
            }
        };
        Ok(HandlerOutcome::Continue(text))
    }

    fn prompt(&self) -> String {
        r#"# Patch

Edit a file with a <PATCH> block. Either give the complete new file content in a code fence:

<PATCH>
File: path/to/file
Reason: why the change is needed
```language
complete file content
```
</PATCH>

or replace one exact snippet of the existing file:

<PATCH>
File: path/to/file
Reason: why the change is needed
<<<<<<< SEARCH
exact existing lines
=======
replacement lines
>>>>>>> REPLACE
</PATCH>

Send only one <PATCH> block per turn."#
            .to_string()
    }
}
