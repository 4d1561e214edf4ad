//! Methodology library of past problem/approach pairs used to prime a new run.
//!
//! Stored as a YAML mapping of problem description to methodology text.
//! Models that accept files get the whole library uploaded; the rest get the
//! entries whose problem shares the most words with the task.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use turnstile_core::error::{Error, Result};
use turnstile_core::model::ModelService;

const MAX_MATCHES: usize = 3;
const MIN_SCORE: f64 = 0.5;

#[derive(Debug, Clone, Default)]
pub struct MethodologyLibrary {
    entries: BTreeMap<String, String>,
}

impl MethodologyLibrary {
    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// Load from a YAML file. A missing file is an empty library.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No methodology file");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        // A file holding only comments parses as null.
        let entries: Option<BTreeMap<String, String>> =
            serde_yaml::from_str(&raw).map_err(|e| Error::Config {
                message: format!("invalid methodology file {}: {e}", path.display()),
            })?;
        let entries = entries.unwrap_or_default();
        info!(count = entries.len(), "Loaded methodologies");
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries relevant to `task`, best first. Falls back to every entry
    /// when nothing scores high enough.
    pub fn relevant(&self, task: &str) -> Vec<(&str, &str)> {
        let task_words = words(task);
        let mut scored: Vec<(f64, &str, &str)> = self
            .entries
            .iter()
            .map(|(problem, method)| (overlap(&task_words, problem), problem.as_str(), method.as_str()))
            .filter(|(score, _, _)| *score >= MIN_SCORE)
            .collect();

        if scored.is_empty() {
            return self.entries.iter().map(|(p, m)| (p.as_str(), m.as_str())).collect();
        }

        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored
            .into_iter()
            .take(MAX_MATCHES)
            .map(|(_, p, m)| (p, m))
            .collect()
    }

    /// Prompt text for `task`, or "" for an empty library.
    pub fn prompt_for(&self, task: &str) -> String {
        if self.entries.is_empty() {
            return String::new();
        }
        render(&self.relevant(task))
    }

    /// Upload the whole library plus `extra_files`. The library is written
    /// to a temporary file that is removed before returning.
    pub async fn upload(&self, model: &dyn ModelService, extra_files: &[PathBuf]) -> bool {
        let mut paths = Vec::with_capacity(extra_files.len() + 1);
        let temp = match self.write_temp() {
            Ok(temp) => temp,
            Err(e) => {
                warn!(error = %e, "Could not stage methodology for upload");
                return false;
            }
        };
        if let Some(file) = &temp {
            paths.push(file.path().to_path_buf());
        }
        paths.extend(extra_files.iter().cloned());
        if paths.is_empty() {
            return true;
        }

        let uploaded = model.upload_files(&paths).await;
        if let Some(file) = temp
            && let Err(e) = file.close()
        {
            warn!(error = %e, "Failed to remove methodology upload file");
        }
        uploaded
    }

    fn write_temp(&self) -> std::io::Result<Option<tempfile::NamedTempFile>> {
        if self.entries.is_empty() {
            return Ok(None);
        }
        let mut file = tempfile::Builder::new()
            .prefix("methodology-")
            .suffix(".md")
            .tempfile()?;
        let all: Vec<(&str, &str)> = self.entries.iter().map(|(p, m)| (p.as_str(), m.as_str())).collect();
        file.write_all(render(&all).as_bytes())?;
        file.flush()?;
        Ok(Some(file))
    }
}

fn render(entries: &[(&str, &str)]) -> String {
    let mut out = String::from(
        "Standard methodologies for previously solved problems. \
         If the current task is similar, follow them; otherwise ignore them.\n",
    );
    for (problem, method) in entries {
        out.push_str(&format!("Problem: {problem}\nMethodology: {method}\n"));
    }
    out
}

fn words(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 1)
        .map(|w| w.to_lowercase())
        .collect()
}

/// Share of the problem's words that also appear in the task.
fn overlap(task_words: &BTreeSet<String>, problem: &str) -> f64 {
    let problem_words = words(problem);
    if problem_words.is_empty() {
        return 0.0;
    }
    let shared = problem_words.intersection(task_words).count();
    shared as f64 / problem_words.len() as f64
}
