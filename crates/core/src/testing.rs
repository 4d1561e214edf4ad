//! Scripted doubles for the model and the operator.
//!
//! Enabled with the `test-utils` feature so every crate in the workspace can
//! drive the agent loop deterministically.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::ProviderError;
use crate::human::HumanInput;
use crate::interrupt::InterruptSignal;
use crate::model::ModelService;

/// A model that returns a fixed sequence of responses.
///
/// Every prompt is recorded. Once the script runs out, `chat` returns a
/// provider error so a miscounted script surfaces as a failed run.
pub struct ScriptedModel {
    name: String,
    responses: Mutex<VecDeque<Result<String, ProviderError>>>,
    prompts: Mutex<Vec<String>>,
    system_prompts: Mutex<Vec<String>>,
    resets: Mutex<usize>,
    uploads: Mutex<Vec<String>>,
    uploaded_paths: Mutex<Vec<PathBuf>>,
    upload_support: bool,
    upload_succeeds: bool,
    interrupt_on: Option<(usize, InterruptSignal)>,
}

impl ScriptedModel {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: "scripted".into(),
            responses: Mutex::new(responses.into_iter().map(|r| Ok(r.into())).collect()),
            prompts: Mutex::new(Vec::new()),
            system_prompts: Mutex::new(Vec::new()),
            resets: Mutex::new(0),
            uploads: Mutex::new(Vec::new()),
            uploaded_paths: Mutex::new(Vec::new()),
            upload_support: false,
            upload_succeeds: true,
            interrupt_on: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Append a failing turn to the script.
    pub fn then_fail(self, error: ProviderError) -> Self {
        self.responses.lock().unwrap().push_back(Err(error));
        self
    }

    /// Advertise file upload; `succeeds` decides what `upload_files` returns.
    pub fn with_upload(mut self, succeeds: bool) -> Self {
        self.upload_support = true;
        self.upload_succeeds = succeeds;
        self
    }

    /// Raise `signal` while answering the `call`-th prompt (zero-based).
    pub fn with_interrupt_on(mut self, call: usize, signal: InterruptSignal) -> Self {
        self.interrupt_on = Some((call, signal));
        self
    }

    /// Every prompt received so far, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn system_prompts(&self) -> Vec<String> {
        self.system_prompts.lock().unwrap().clone()
    }

    pub fn reset_count(&self) -> usize {
        *self.resets.lock().unwrap()
    }

    /// Contents of every uploaded file, read at upload time.
    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }

    /// The paths handed to `upload_files`, in order.
    pub fn uploaded_paths(&self) -> Vec<PathBuf> {
        self.uploaded_paths.lock().unwrap().clone()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelService for ScriptedModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_system_prompt(&self, prompt: &str) {
        self.system_prompts.lock().unwrap().push(prompt.to_string());
    }

    async fn chat(&self, prompt: &str) -> Result<String, ProviderError> {
        let call = {
            let mut prompts = self.prompts.lock().unwrap();
            prompts.push(prompt.to_string());
            prompts.len() - 1
        };
        if let Some((at, signal)) = &self.interrupt_on
            && *at == call
        {
            signal.raise();
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(ProviderError::ApiError {
                    status_code: 0,
                    message: format!("no scripted response for call #{call}"),
                })
            })
    }

    async fn reset(&self) {
        *self.resets.lock().unwrap() += 1;
    }

    fn supports_file_upload(&self) -> bool {
        self.upload_support
    }

    async fn upload_files(&self, paths: &[PathBuf]) -> bool {
        let mut uploads = self.uploads.lock().unwrap();
        for path in paths {
            uploads.push(std::fs::read_to_string(path).unwrap_or_default());
        }
        self.uploaded_paths.lock().unwrap().extend(paths.iter().cloned());
        self.upload_succeeds
    }
}

/// An operator that answers from queues.
///
/// Empty queues answer `ask` with "" and `confirm` with the default.
#[derive(Default)]
pub struct ScriptedInput {
    answers: Mutex<VecDeque<String>>,
    confirmations: Mutex<VecDeque<bool>>,
    asked: Mutex<Vec<String>>,
}

impl ScriptedInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answers<I, S>(self, answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.answers
            .lock()
            .unwrap()
            .extend(answers.into_iter().map(Into::into));
        self
    }

    pub fn confirmations(self, confirmations: impl IntoIterator<Item = bool>) -> Self {
        self.confirmations.lock().unwrap().extend(confirmations);
        self
    }

    /// Every question and confirmation prompt shown, in order.
    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().unwrap().clone()
    }
}

#[async_trait]
impl HumanInput for ScriptedInput {
    async fn ask(&self, prompt: &str) -> String {
        self.asked.lock().unwrap().push(prompt.to_string());
        self.answers.lock().unwrap().pop_front().unwrap_or_default()
    }

    async fn confirm(&self, prompt: &str, default: bool) -> bool {
        self.asked.lock().unwrap().push(prompt.to_string());
        self.confirmations
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(default)
    }
}
