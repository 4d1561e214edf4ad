//! History compaction.
//!
//! When the conversation outgrows the token budget the model's context is
//! dropped and replaced by a seed: either a model-written summary, or (for
//! models that accept files) an uploaded copy of the transcript plus a short
//! pointer to it.

use std::fmt;
use std::io::Write;
use tracing::{info, warn};
use turnstile_core::message::render_transcript;
use turnstile_core::model::ModelService;

use super::session::Session;
use crate::prompts::{SUMMARY_REQUEST_PROMPT, UPLOAD_SEED, summary_seed};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionMode {
    Summary,
    Upload,
}

impl fmt::Display for CompactionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompactionMode::Summary => write!(f, "summary"),
            CompactionMode::Upload => write!(f, "upload"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compaction {
    pub mode: CompactionMode,
    /// Text to put in front of the next prompt. May be empty.
    pub seed: String,
    pub tokens_before: usize,
}

/// Drop the model's context and the local transcript, then restore the
/// system prompt.
pub async fn clear_history(model: &dyn ModelService, system_prompt: &str, session: &mut Session) {
    model.reset().await;
    model.set_system_prompt(system_prompt);
    session.clear_history();
}

/// Compact the conversation and return the seed for the next prompt.
pub async fn compact(model: &dyn ModelService, system_prompt: &str, session: &mut Session) -> Compaction {
    let tokens_before = session.conversation_length();

    if model.supports_file_upload() {
        match stage_transcript(session) {
            Ok(file) => {
                clear_history(model, system_prompt, session).await;
                let uploaded = model.upload_files(&[file.path().to_path_buf()]).await;
                if let Err(e) = file.close() {
                    warn!(error = %e, "Failed to remove transcript file");
                }
                info!(tokens_before, uploaded, "History compacted by upload");
                return Compaction {
                    mode: CompactionMode::Upload,
                    seed: if uploaded { UPLOAD_SEED.to_string() } else { String::new() },
                    tokens_before,
                };
            }
            Err(e) => warn!(error = %e, "Could not stage transcript, falling back to summary"),
        }
    }

    let summary = match model.chat(SUMMARY_REQUEST_PROMPT).await {
        Ok(summary) => summary,
        Err(e) => {
            warn!(error = %e, "Summary request failed, history dropped without summary");
            String::new()
        }
    };
    clear_history(model, system_prompt, session).await;
    info!(tokens_before, summary_len = summary.len(), "History compacted by summary");

    Compaction {
        mode: CompactionMode::Summary,
        seed: if summary.trim().is_empty() {
            String::new()
        } else {
            summary_seed(summary.trim())
        },
        tokens_before,
    }
}

fn stage_transcript(session: &Session) -> std::io::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("history-")
        .suffix(".txt")
        .tempfile()?;
    file.write_all(render_transcript(session.history()).as_bytes())?;
    file.flush()?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnstile_core::error::ProviderError;
    use turnstile_core::testing::ScriptedModel;

    fn busy_session() -> Session {
        let mut session = Session::new();
        session.record_sent("first question");
        session.record_received("first answer");
        session.addon_prompt = "keep me".into();
        session.set_user_data("k", serde_json::json!(true));
        session
    }

    #[tokio::test]
    async fn summary_mode_seeds_with_summary() {
        let model = ScriptedModel::new(["the gist"]);
        let mut session = busy_session();
        let before = session.conversation_length();

        let c = compact(&model, "SYS", &mut session).await;

        assert_eq!(c.mode, CompactionMode::Summary);
        assert_eq!(c.tokens_before, before);
        assert!(c.seed.contains("the gist"));
        assert_eq!(model.prompts(), vec![SUMMARY_REQUEST_PROMPT.to_string()]);
        assert_eq!(model.reset_count(), 1);
        assert_eq!(model.system_prompts(), vec!["SYS".to_string()]);
        assert_eq!(session.conversation_length(), 0);
        assert!(session.history().is_empty());
        assert_eq!(session.addon_prompt, "keep me");
        assert!(session.get_user_data("k").is_some());
    }

    #[tokio::test]
    async fn empty_or_failed_summary_gives_empty_seed() {
        let model = ScriptedModel::new(["   "]);
        let c = compact(&model, "", &mut busy_session()).await;
        assert!(c.seed.is_empty());

        let model = ScriptedModel::new(Vec::<String>::new()).then_fail(ProviderError::Network("x".into()));
        let mut session = busy_session();
        let c = compact(&model, "", &mut session).await;
        assert!(c.seed.is_empty());
        assert_eq!(session.conversation_length(), 0);
    }

    #[tokio::test]
    async fn upload_mode_sends_transcript() {
        let model = ScriptedModel::new(Vec::<String>::new()).with_upload(true);
        let mut session = busy_session();

        let c = compact(&model, "SYS", &mut session).await;

        assert_eq!(c.mode, CompactionMode::Upload);
        assert_eq!(c.seed, UPLOAD_SEED);
        assert_eq!(model.call_count(), 0);
        let uploads = model.uploads();
        assert_eq!(uploads.len(), 1);
        assert!(uploads[0].contains("first question"));
        assert!(uploads[0].contains("first answer"));
        assert!(session.history().is_empty());

        let staged = model.uploaded_paths();
        assert_eq!(staged.len(), 1);
        assert!(!staged[0].exists());
    }

    #[tokio::test]
    async fn failed_upload_gives_empty_seed() {
        let model = ScriptedModel::new(Vec::<String>::new()).with_upload(false);
        let c = compact(&model, "SYS", &mut busy_session()).await;
        assert_eq!(c.mode, CompactionMode::Upload);
        assert!(c.seed.is_empty());

        let staged = model.uploaded_paths();
        assert_eq!(staged.len(), 1);
        assert!(!staged[0].exists());
    }
}
