//! The agent loop: a turn-based state machine over one model session.
//!
//! Each turn sends the pending prompt plus exactly one addon, parses the
//! response into typed actions, checks for an operator interrupt, offers the
//! parse to the output handlers in registration order and feeds the first
//! match's result into the next turn. A run ends when a handler terminates
//! it, when the operator has nothing more to add, or when the model emits the
//! completion marker with auto-complete on.

use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use turnstile_config::AgentSettings;
use turnstile_core::action::{ParsedResponse, RoutedMessage};
use turnstile_core::error::{Error, Result};
use turnstile_core::event::{DomainEvent, EventBus};
use turnstile_core::handler::{ActionResult, HandlerOutcome, OutputHandler, first_match};
use turnstile_core::human::{HumanInput, Unattended};
use turnstile_core::interrupt::InterruptSignal;
use turnstile_core::model::ModelService;
use turnstile_tools::MemoryStore;

use crate::context::compaction::{self, Compaction};
use crate::context::{Session, TokenBudget};
use crate::dispatcher::ToolDispatcher;
use crate::input::{BuiltinDirectives, InputContext, InputHandler, InputOutcome, SessionCommand};
use crate::methodology::MethodologyLibrary;
use crate::prompts::{self, COMPLETE_MARKER, SAVE_MEMORY_TOOL};

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Final summary or completion text.
    Completed(String),
    /// "Task failed: …"
    Failed(String),
    /// A handler asked to hand a message to another agent.
    Routed(RoutedMessage),
}

impl RunOutcome {
    fn label(&self) -> &'static str {
        match self {
            RunOutcome::Completed(_) => "completed",
            RunOutcome::Failed(_) => "failed",
            RunOutcome::Routed(_) => "routed",
        }
    }
}

impl From<ActionResult> for RunOutcome {
    fn from(result: ActionResult) -> Self {
        match result {
            ActionResult::Text(text) => RunOutcome::Completed(text),
            ActionResult::Message(message) => RunOutcome::Routed(message),
        }
    }
}

/// Called after every executed action with the handler's name.
pub type AfterActionHook = Box<dyn Fn(&str, &mut Session) -> Result<()> + Send + Sync>;

/// What the operator decided at an interrupt checkpoint.
enum Intervention {
    /// Nothing to add: finish the task.
    Finish,
    /// Run the pending action; the note prefixes its result.
    Proceed(String),
    /// Send this text instead of acting.
    Redirect(String),
}

pub struct Agent {
    name: String,
    model: Arc<dyn ModelService>,
    system_prompt: String,
    handlers: Vec<Arc<dyn OutputHandler>>,
    input_handlers: Vec<Arc<dyn InputHandler>>,
    tool_names: Vec<String>,
    human: Arc<dyn HumanInput>,
    interrupt: InterruptSignal,
    event_bus: Arc<EventBus>,
    session: Session,
    budget: TokenBudget,
    settings: AgentSettings,
    memory: Option<Arc<MemoryStore>>,
    methodology: Option<MethodologyLibrary>,
    files: Vec<PathBuf>,
    after_action: Option<AfterActionHook>,
    first_run: bool,
    run_input_handlers_next_turn: bool,
    turn: u32,
}

impl Agent {
    pub fn new(name: impl Into<String>, model: Arc<dyn ModelService>) -> Self {
        Self {
            name: name.into(),
            model,
            system_prompt: prompts::default_system_prompt(),
            handlers: Vec::new(),
            input_handlers: vec![Arc::new(BuiltinDirectives)],
            tool_names: Vec::new(),
            human: Arc::new(Unattended),
            interrupt: InterruptSignal::new(),
            event_bus: Arc::new(EventBus::default()),
            session: Session::new(),
            budget: TokenBudget::new(turnstile_config::ModelConfig::default().max_token_count),
            settings: AgentSettings::default(),
            memory: None,
            methodology: None,
            files: Vec::new(),
            after_action: None,
            first_run: true,
            run_input_handlers_next_turn: false,
            turn: 0,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Register the tool dispatcher as an output handler.
    pub fn with_tools(mut self, dispatcher: ToolDispatcher) -> Self {
        self.tool_names = dispatcher.tool_names().iter().map(|n| n.to_string()).collect();
        self.handlers.push(Arc::new(dispatcher));
        self
    }

    /// Register an output handler. Handlers are consulted in the order
    /// they were added.
    pub fn with_handler(mut self, handler: Arc<dyn OutputHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_input_handler(mut self, handler: Arc<dyn InputHandler>) -> Self {
        self.input_handlers.push(handler);
        self
    }

    pub fn with_human(mut self, human: Arc<dyn HumanInput>) -> Self {
        self.human = human;
        self
    }

    pub fn with_interrupt(mut self, signal: InterruptSignal) -> Self {
        self.interrupt = signal;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = bus;
        self
    }

    pub fn with_settings(mut self, settings: AgentSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_max_token_count(mut self, max: usize) -> Self {
        self.budget = TokenBudget::new(max);
        self
    }

    /// Memory store whose tags are listed to the model on the first turn.
    pub fn with_memory(mut self, store: Arc<MemoryStore>) -> Self {
        self.memory = Some(store);
        self
    }

    pub fn with_methodology(mut self, library: MethodologyLibrary) -> Self {
        self.methodology = Some(library);
        self
    }

    /// Files handed to the model on the first turn. Disables methodology.
    pub fn with_files(mut self, files: Vec<PathBuf>) -> Self {
        self.files = files;
        self
    }

    pub fn with_after_action(mut self, hook: AfterActionHook) -> Self {
        self.after_action = Some(hook);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn interrupt_signal(&self) -> InterruptSignal {
        self.interrupt.clone()
    }

    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    pub fn set_addon_prompt(&mut self, addon: impl Into<String>) {
        self.session.addon_prompt = addon.into();
    }

    /// Run the next turn's prompt through the input handlers, as if the
    /// user had typed it.
    pub fn set_run_input_handlers_next_turn(&mut self, value: bool) {
        self.run_input_handlers_next_turn = value;
    }

    /// The system prompt actually installed on the model: the base prompt
    /// followed by every handler's action description.
    pub fn full_system_prompt(&self) -> String {
        if self.handlers.is_empty() {
            return self.system_prompt.clone();
        }
        format!("{}\n\n{}", self.system_prompt, prompts::action_prompt(&self.handlers))
    }

    /// Reset the session and the model's context. User data survives.
    pub async fn clear(&mut self) {
        compaction::clear_history(self.model.as_ref(), &self.full_system_prompt(), &mut self.session).await;
        self.session.clear();
    }

    /// Drop the model's context and the transcript, keeping the addon and
    /// user data.
    pub async fn clear_history(&mut self) {
        compaction::clear_history(self.model.as_ref(), &self.full_system_prompt(), &mut self.session).await;
    }

    /// Compact the conversation now and return the seed for the next prompt.
    pub async fn summarize_and_clear_history(&mut self) -> Compaction {
        let system_prompt = self.full_system_prompt();
        let result = compaction::compact(self.model.as_ref(), &system_prompt, &mut self.session).await;
        self.publish(DomainEvent::HistoryCompacted {
            agent: self.name.clone(),
            mode: result.mode.to_string(),
            tokens_before: result.tokens_before,
            timestamp: Utc::now(),
        });
        result
    }

    /// Run a task to completion.
    pub async fn run(&mut self, input: &str) -> RunOutcome {
        info!(agent = %self.name, "Run started");
        self.session.prompt = input.to_string();

        let outcome = match self.main_loop().await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(agent = %self.name, error = %e, "Task failed");
                RunOutcome::Failed(format!("Task failed: {e}"))
            }
        };

        info!(agent = %self.name, outcome = outcome.label(), turns = self.turn, "Run finished");
        self.publish(DomainEvent::RunFinished {
            agent: self.name.clone(),
            outcome: outcome.label().to_string(),
            timestamp: Utc::now(),
        });
        outcome
    }

    async fn main_loop(&mut self) -> Result<RunOutcome> {
        let mut run_input_handlers = true;

        loop {
            if std::mem::take(&mut self.run_input_handlers_next_turn) {
                run_input_handlers = true;
            }
            if self.first_run {
                self.prepare_first_run().await;
            }

            let prompt = std::mem::take(&mut self.session.prompt);
            let response = self.call_model(prompt, true, run_input_handlers).await?;
            run_input_handlers = false;

            let Some(response) = response else {
                // An input handler consumed the turn. A compaction seed it left
                // behind leads the next input.
                match self.await_user().await {
                    Some(next) => {
                        let seed = std::mem::take(&mut self.session.prompt);
                        self.session.prompt = if seed.is_empty() {
                            next
                        } else {
                            format!("{seed}\n\n{next}")
                        };
                        run_input_handlers = true;
                        continue;
                    }
                    None => return Ok(RunOutcome::Completed(self.complete_task(false).await)),
                }
            };
            let parsed = ParsedResponse::parse(&response);

            let mut note = None;
            if self.interrupt.take() {
                match self.intervene(&parsed, "Interrupted during model interaction").await {
                    Intervention::Finish => {
                        return Ok(RunOutcome::Completed(self.complete_task(false).await));
                    }
                    Intervention::Proceed(text) => note = Some(text),
                    Intervention::Redirect(text) => {
                        self.session.prompt = text;
                        run_input_handlers = true;
                        continue;
                    }
                }
            }

            match self.dispatch(&parsed).await? {
                Some(HandlerOutcome::Terminate(result)) => return Ok(result.into()),
                Some(HandlerOutcome::Continue(text)) => {
                    self.session.prompt = match note {
                        Some(note) => format!("{note}\n\n{text}"),
                        None => text,
                    };
                }
                None => {
                    if let Some(note) = note {
                        self.session.prompt = note;
                    }
                }
            }

            if !self.session.prompt.is_empty() || !self.session.addon_prompt.is_empty() {
                continue;
            }

            if self.settings.auto_complete && parsed.has_marker(COMPLETE_MARKER) {
                info!(agent = %self.name, "Completion marker received");
                return Ok(RunOutcome::Completed(self.complete_task(true).await));
            }

            match self.await_user().await {
                Some(next) => {
                    self.session.prompt = next;
                    run_input_handlers = true;
                }
                None => return Ok(RunOutcome::Completed(self.complete_task(false).await)),
            }
        }
    }

    /// Assemble and send one prompt. `None` means an input handler stopped
    /// the turn before the model was called.
    async fn call_model(
        &mut self,
        message: String,
        need_complete: bool,
        run_input_handlers: bool,
    ) -> Result<Option<String>> {
        let mut message = message;
        if run_input_handlers {
            match self.process_input(message).await? {
                Some(processed) => message = processed,
                None => return Ok(None),
            }
        }

        let addon = if self.session.addon_prompt.is_empty() {
            self.default_addon(need_complete)
        } else {
            std::mem::take(&mut self.session.addon_prompt)
        };
        let message = self.manage_length(format!("{message}\n\n{addon}")).await;

        self.turn += 1;
        debug!(
            agent = %self.name,
            turn = self.turn,
            tokens = self.session.conversation_length(),
            "Sending prompt"
        );
        self.publish(DomainEvent::TurnStarted {
            agent: self.name.clone(),
            turn: self.turn,
            conversation_length: self.session.conversation_length(),
            timestamp: Utc::now(),
        });

        let response = self.model.chat(&message).await?;
        self.session.record_received(&response);
        Ok(Some(response))
    }

    async fn process_input(&mut self, text: String) -> Result<Option<String>> {
        let context = InputContext {
            tool_names: self.tool_names.clone(),
            action_prompt: prompts::action_prompt(&self.handlers),
        };
        let mut text = text;
        for handler in self.input_handlers.clone() {
            match handler.process(text, &context).await? {
                InputOutcome::Forward { text: next, addon } => {
                    text = next;
                    if let Some(addon) = addon.filter(|a| !a.is_empty()) {
                        if !self.session.addon_prompt.is_empty() {
                            self.session.addon_prompt.push('\n');
                        }
                        self.session.addon_prompt.push_str(&addon);
                    }
                }
                InputOutcome::Return { command } => {
                    debug!(agent = %self.name, handler = handler.name(), ?command, "Input handler ended the turn");
                    match command {
                        Some(SessionCommand::Summarize) => {
                            let result = self.summarize_and_clear_history().await;
                            self.session.prompt = result.seed;
                        }
                        Some(SessionCommand::Clear) => self.clear().await,
                        None => {}
                    }
                    return Ok(None);
                }
            }
        }
        Ok(Some(text))
    }

    fn default_addon(&self, need_complete: bool) -> String {
        let actions = self.handler_names();
        let tools: Vec<&str> = self.tool_names.iter().map(String::as_str).collect();
        prompts::default_addon(&actions, &tools, need_complete && self.settings.auto_complete)
    }

    /// Account for `message` and compact first if the budget is exceeded.
    async fn manage_length(&mut self, message: String) -> String {
        self.session.record_sent(&message);
        if !self.budget.should_compact(self.session.conversation_length()) {
            return message;
        }

        info!(
            agent = %self.name,
            tokens = self.session.conversation_length(),
            max = self.budget.max_tokens(),
            "Context over budget, compacting"
        );
        let seed = self.summarize_and_clear_history().await.seed;
        let message = if seed.is_empty() {
            message
        } else {
            format!("{seed}\n\n{message}")
        };
        self.session.record_sent(&message);
        message
    }

    /// Offer the response to the handlers. `None` when nothing matched or
    /// the operator declined to run the action.
    async fn dispatch(&mut self, parsed: &ParsedResponse) -> Result<Option<HandlerOutcome>> {
        let Some(handler) = first_match(&self.handlers, parsed).cloned() else {
            let feedback = parsed.protocol_feedback();
            if feedback.is_some() {
                warn!(agent = %self.name, "Unclaimed action blocks, sending format feedback");
            }
            return Ok(feedback.map(HandlerOutcome::Continue));
        };

        if self.settings.execute_tool_confirm {
            let question = format!("Execute {}?", handler.name());
            if !self.human.confirm(&question, true).await {
                info!(agent = %self.name, handler = handler.name(), "Operator declined the action");
                return Ok(None);
            }
        }

        let outcome = match handler.handle(parsed).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(agent = %self.name, handler = handler.name(), error = %e, "Handler failed");
                HandlerOutcome::Continue(format!("Action {} failed: {e}", handler.name()))
            }
        };
        debug!(agent = %self.name, handler = handler.name(), terminal = outcome.is_terminal(), "Action executed");
        self.publish(DomainEvent::ActionExecuted {
            agent: self.name.clone(),
            handler: handler.name().to_string(),
            terminal: outcome.is_terminal(),
            timestamp: Utc::now(),
        });

        if let Some(hook) = &self.after_action {
            hook(handler.name(), &mut self.session).map_err(|e| Error::Handler {
                handler: handler.name().to_string(),
                reason: format!("after-action callback failed: {e}"),
            })?;
        }
        Ok(Some(outcome))
    }

    async fn intervene(&mut self, parsed: &ParsedResponse, context: &str) -> Intervention {
        info!(agent = %self.name, "Interrupt observed");
        self.publish(DomainEvent::InterruptObserved {
            agent: self.name.clone(),
            timestamp: Utc::now(),
        });

        let text = self
            .human
            .ask(&format!("{context}. Enter your intervention:"))
            .await;
        if text.trim().is_empty() {
            return Intervention::Finish;
        }

        if first_match(&self.handlers, parsed).is_none() {
            return Intervention::Redirect(prompts::interrupt_note(&text));
        }
        if self.human.confirm("An action is pending. Continue with it?", true).await {
            Intervention::Proceed(prompts::interrupt_accepted(&text))
        } else {
            Intervention::Redirect(prompts::interrupt_declined(&text))
        }
    }

    async fn await_user(&self) -> Option<String> {
        let answer = self.human.ask(&prompts::next_input_question(&self.name)).await;
        (!answer.trim().is_empty()).then_some(answer)
    }

    // --- first run ---

    async fn prepare_first_run(&mut self) {
        self.first_run = false;
        self.model.set_system_prompt(&self.full_system_prompt());

        let tags_hint = self.memory_tags_hint().await;
        let use_methodology =
            self.settings.use_methodology && self.files.is_empty() && self.methodology.is_some();

        if self.model.supports_file_upload() {
            if use_methodology {
                let uploaded = match &self.methodology {
                    Some(library) => library.upload(self.model.as_ref(), &self.files).await,
                    None => false,
                };
                if uploaded {
                    self.session.prompt.push_str(
                        "\n\nThe uploaded files contain past conversation history and methodologies; \
                         draw on them where they help.",
                    );
                } else {
                    warn!(agent = %self.name, "Methodology upload failed, loading locally");
                    self.append_local_methodology();
                }
            } else if !self.files.is_empty() {
                if self.model.upload_files(&self.files).await {
                    self.session.prompt.push_str(
                        "\n\nThe uploaded files contain past conversation history; draw on them where they help.",
                    );
                } else {
                    warn!(agent = %self.name, files = self.files.len(), "File upload failed, ignoring files");
                }
            }
        } else {
            if !self.files.is_empty() {
                debug!(agent = %self.name, model = self.model.name(), "Model cannot take files, listing paths");
                self.session.prompt.push_str(&prompts::file_listing(&self.files));
            }
            if use_methodology {
                self.append_local_methodology();
            }
        }

        self.session.prompt.push_str(&tags_hint);
    }

    fn append_local_methodology(&mut self) {
        let Some(library) = &self.methodology else {
            return;
        };
        let methodology = library.prompt_for(&self.session.prompt);
        if methodology.is_empty() {
            return;
        }
        debug!(agent = %self.name, "Appending local methodology");
        self.session.prompt.push_str(&format!(
            "\n\nBelow are past experiences with similar problems, for reference:\n{methodology}"
        ));
    }

    async fn memory_tags_hint(&self) -> String {
        let mut hint = String::new();
        if self.has_tool(SAVE_MEMORY_TOOL) {
            hint.push_str(
                "\n\nTip: before analysing the task, consider recording key information with \
                 save_memory so it can be retrieved and reused later.",
            );
        }
        let Some(store) = &self.memory else {
            return hint;
        };
        let tags = store.tags().await;
        if tags.values().all(|t| t.is_empty()) {
            return hint;
        }
        hint.push_str("\n\nThese memory tags exist; use retrieve_memory to look up related memories:");
        for (memory_type, tags) in tags.iter().filter(|(_, t)| !t.is_empty()) {
            let list: Vec<&str> = tags.iter().map(String::as_str).collect();
            hint.push_str(&format!("\n- {memory_type}: {}", list.join(", ")));
        }
        hint
    }

    fn has_tool(&self, name: &str) -> bool {
        self.tool_names.iter().any(|n| n == name)
    }

    // --- completion ---

    /// Wrap up a finished task. Every step is best-effort: failures are
    /// logged and the run still completes.
    async fn complete_task(&mut self, auto_completed: bool) -> String {
        let mut feedback = String::new();
        if !auto_completed && self.settings.use_analysis {
            if self.human.confirm("Are you satisfied with how the task was completed?", true).await {
                feedback = "\n\nThe user is satisfied with how the task was completed.".into();
            } else {
                let text = self.human.ask("Please give your feedback (blank to skip):").await;
                feedback = if text.trim().is_empty() {
                    "\n\nThe user is not satisfied with how the task was completed and gave no specific feedback."
                        .into()
                } else {
                    format!("\n\nThe user is not satisfied with how the task was completed. Feedback:\n{text}")
                };
            }
        }

        if self.settings.use_analysis {
            self.analyze_task(&feedback).await;
        } else {
            self.prompt_memory_save().await;
        }

        if !self.settings.need_summary {
            return "Task completed".into();
        }
        if self.settings.use_analysis {
            self.prompt_memory_save().await;
        }

        let summary_prompt = self
            .settings
            .summary_prompt
            .clone()
            .unwrap_or_else(|| prompts::DEFAULT_SUMMARY_PROMPT.to_string());
        info!(agent = %self.name, "Generating summary");
        match self.model.chat(&summary_prompt).await {
            Ok(summary) => summary,
            Err(e) => {
                warn!(agent = %self.name, error = %e, "Summary generation failed");
                "Task completed".into()
            }
        }
    }

    /// Self-analysis: let the model act on the analysis prompt until it
    /// answers without an action, the operator stops it, or the round limit
    /// is hit.
    async fn analyze_task(&mut self, feedback: &str) {
        info!(agent = %self.name, "Analyzing task");
        let mut prompt = format!("{}{feedback}", prompts::TASK_ANALYSIS_PROMPT);

        for _ in 0..self.settings.max_analysis_rounds {
            let response = match self.model.chat(&prompt).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(agent = %self.name, error = %e, "Task analysis failed");
                    return;
                }
            };
            let parsed = ParsedResponse::parse(&response);

            let mut note = None;
            if self.interrupt.take() {
                match self.intervene(&parsed, "Interrupted during task analysis").await {
                    Intervention::Finish => return,
                    Intervention::Proceed(text) => note = Some(text),
                    Intervention::Redirect(text) => {
                        prompt = text;
                        continue;
                    }
                }
            }

            let next = match self.dispatch(&parsed).await {
                Ok(Some(HandlerOutcome::Continue(text))) => match note {
                    Some(note) => format!("{note}\n\n{text}"),
                    None => text,
                },
                Ok(Some(HandlerOutcome::Terminate(_))) => return,
                Ok(None) => note.unwrap_or_default(),
                Err(e) => {
                    warn!(agent = %self.name, error = %e, "Task analysis failed");
                    return;
                }
            };
            if next.is_empty() {
                debug!(agent = %self.name, "Task analysis finished");
                return;
            }
            prompt = next;
        }
        warn!(
            agent = %self.name,
            rounds = self.settings.max_analysis_rounds,
            "Task analysis stopped at the round limit"
        );
    }

    async fn prompt_memory_save(&mut self) {
        if !self.has_tool(SAVE_MEMORY_TOOL) {
            return;
        }
        debug!(agent = %self.name, "Asking the model for memories worth saving");
        let response = match self.model.chat(prompts::MEMORY_SAVE_PROMPT).await {
            Ok(response) => response,
            Err(e) => {
                warn!(agent = %self.name, error = %e, "Memory save prompt failed");
                return;
            }
        };
        match self.dispatch(&ParsedResponse::parse(&response)).await {
            Ok(Some(_)) => info!(agent = %self.name, "Memory save prompt produced an action"),
            Ok(None) => debug!(agent = %self.name, "Nothing worth remembering"),
            Err(e) => warn!(agent = %self.name, error = %e, "Saving memories failed"),
        }
    }

    fn publish(&self, event: DomainEvent) {
        self.event_bus.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use turnstile_core::error::ToolError;
    use turnstile_core::testing::{ScriptedInput, ScriptedModel};
    use turnstile_core::tool::{Tool, ToolOutput, ToolRegistry};
    use turnstile_tools::MemoryType;

    use crate::context::estimate_tokens;
    use crate::prompts::{DEFAULT_SUMMARY_PROMPT, SUMMARY_REQUEST_PROMPT, UPLOAD_SEED};

    struct EchoTool {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the text argument"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"text": "string"})
        }
        async fn execute(&self, args: serde_json::Value) -> std::result::Result<ToolOutput, ToolError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(ToolOutput::ok(args["text"].as_str().unwrap_or_default()))
        }
    }

    struct EndHandler(ActionResult);

    #[async_trait]
    impl OutputHandler for EndHandler {
        fn name(&self) -> &str {
            "END"
        }
        fn can_handle(&self, response: &ParsedResponse) -> bool {
            response.raw().contains("<END>")
        }
        async fn handle(&self, _response: &ParsedResponse) -> Result<HandlerOutcome> {
            Ok(HandlerOutcome::Terminate(self.0.clone()))
        }
        fn prompt(&self) -> String {
            "Write <END> to stop.".into()
        }
    }

    fn quiet() -> AgentSettings {
        AgentSettings {
            need_summary: false,
            use_analysis: false,
            use_methodology: false,
            ..AgentSettings::default()
        }
    }

    fn echo_call(text: &str) -> String {
        format!("<TOOL_CALL>\nname: echo\narguments:\n    text: {text}\n</TOOL_CALL>")
    }

    struct Fixture {
        model: Arc<ScriptedModel>,
        human: Arc<ScriptedInput>,
        runs: Arc<AtomicUsize>,
    }

    fn agent_with(model: ScriptedModel, human: ScriptedInput, settings: AgentSettings) -> (Agent, Fixture) {
        let model = Arc::new(model);
        let human = Arc::new(human);
        let runs = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool { runs: runs.clone() }));

        let agent = Agent::new("main", model.clone())
            .with_system_prompt("SYS")
            .with_tools(ToolDispatcher::new(registry, 100_000))
            .with_human(human.clone())
            .with_settings(settings);
        (agent, Fixture { model, human, runs })
    }

    #[tokio::test]
    async fn echo_tool_scenario() {
        let (mut agent, fx) = agent_with(
            ScriptedModel::new([echo_call("hello"), "Done.".to_string()]),
            ScriptedInput::new(),
            quiet(),
        );

        let outcome = agent.run("say hello").await;

        assert_eq!(outcome, RunOutcome::Completed("Task completed".into()));
        assert_eq!(fx.runs.load(Ordering::SeqCst), 1);
        let prompts = fx.model.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0].starts_with("say hello\n\n"));
        assert!(prompts[0].contains("available actions: TOOL_CALL"));
        assert!(prompts[1].starts_with("stdout:\nhello\n\n"));
        assert_eq!(fx.human.asked(), vec![prompts::next_input_question("main")]);
    }

    #[tokio::test]
    async fn system_prompt_carries_action_descriptions() {
        let (mut agent, fx) = agent_with(ScriptedModel::new(["ok"]), ScriptedInput::new(), quiet());
        agent.run("hi").await;

        let system = &fx.model.system_prompts()[0];
        assert!(system.starts_with("SYS\n\n<actions>"));
        assert!(system.contains("## TOOL_CALL"));
        assert!(system.contains("- Name: echo"));
    }

    #[tokio::test]
    async fn multiple_calls_in_one_response_run_nothing() {
        let response = format!("{}\n{}", echo_call("a"), echo_call("b"));
        let (mut agent, fx) = agent_with(ScriptedModel::new([response, "ok".into()]), ScriptedInput::new(), quiet());

        agent.run("go").await;

        assert_eq!(fx.runs.load(Ordering::SeqCst), 0);
        assert!(fx.model.prompts()[1].contains("one tool call at a time"));
    }

    #[tokio::test]
    async fn user_input_continues_the_run() {
        let (mut agent, fx) = agent_with(
            ScriptedModel::new(["first", "second"]),
            ScriptedInput::new().answers(["more please", ""]),
            quiet(),
        );

        agent.run("start").await;

        let prompts = fx.model.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].starts_with("more please\n\n"));
    }

    #[tokio::test]
    async fn empty_intervention_completes_without_acting() {
        let signal = InterruptSignal::new();
        let (agent, fx) = agent_with(
            ScriptedModel::new([echo_call("x")]).with_interrupt_on(0, signal.clone()),
            ScriptedInput::new().answers([""]),
            quiet(),
        );
        let mut agent = agent.with_interrupt(signal.clone());

        let outcome = agent.run("task").await;

        assert_eq!(outcome, RunOutcome::Completed("Task completed".into()));
        assert_eq!(fx.runs.load(Ordering::SeqCst), 0);
        assert_eq!(fx.model.call_count(), 1);
        assert!(!signal.is_raised());
    }

    #[tokio::test]
    async fn accepted_intervention_prefixes_the_result() {
        let signal = InterruptSignal::new();
        let (agent, fx) = agent_with(
            ScriptedModel::new([echo_call("hi"), "ok".to_string()]).with_interrupt_on(0, signal.clone()),
            ScriptedInput::new().answers(["use caps"]).confirmations([true]),
            quiet(),
        );
        let mut agent = agent.with_interrupt(signal);

        agent.run("task").await;

        assert_eq!(fx.runs.load(Ordering::SeqCst), 1);
        let next = &fx.model.prompts()[1];
        assert!(next.starts_with(&prompts::interrupt_accepted("use caps")));
        assert!(next.contains("stdout:\nhi"));
    }

    #[tokio::test]
    async fn declined_intervention_skips_the_action() {
        let signal = InterruptSignal::new();
        let (agent, fx) = agent_with(
            ScriptedModel::new([echo_call("hi"), "ok".to_string()]).with_interrupt_on(0, signal.clone()),
            ScriptedInput::new().answers(["wrong file"]).confirmations([false]),
            quiet(),
        );
        let mut agent = agent.with_interrupt(signal);

        agent.run("task").await;

        assert_eq!(fx.runs.load(Ordering::SeqCst), 0);
        assert!(fx.model.prompts()[1].starts_with(&prompts::interrupt_declined("wrong file")));
    }

    #[tokio::test]
    async fn intervention_without_action_becomes_prompt() {
        let signal = InterruptSignal::new();
        let (agent, fx) = agent_with(
            ScriptedModel::new(["thinking...", "ok"]).with_interrupt_on(0, signal.clone()),
            ScriptedInput::new().answers(["also check tests"]),
            quiet(),
        );
        let mut agent = agent.with_interrupt(signal);

        agent.run("task").await;

        assert!(fx.model.prompts()[1].starts_with(&prompts::interrupt_note("also check tests")));
    }

    #[tokio::test]
    async fn compaction_resets_length_to_seed() {
        let (agent, fx) = agent_with(ScriptedModel::new(["the gist", "Done."]), ScriptedInput::new(), quiet());
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let mut agent = agent.with_max_token_count(50).with_event_bus(bus);

        agent.run("task").await;

        let prompts = fx.model.prompts();
        assert_eq!(prompts[0], SUMMARY_REQUEST_PROMPT);
        assert!(prompts[1].starts_with("Key information from the previous conversation:\n<content>\nthe gist\n"));
        assert!(prompts[1].contains("\n\ntask\n\n"));
        assert_eq!(fx.model.reset_count(), 1);

        let session = agent.session();
        assert_eq!(session.history().len(), 2);
        assert_eq!(
            session.conversation_length(),
            estimate_tokens(&prompts[1]) + estimate_tokens("Done.")
        );

        let mut compacted = false;
        while let Ok(event) = rx.try_recv() {
            if let DomainEvent::HistoryCompacted { mode, .. } = event.as_ref() {
                assert_eq!(mode, "summary");
                compacted = true;
            }
        }
        assert!(compacted);
    }

    #[tokio::test]
    async fn upload_compaction_seeds_with_pointer() {
        let (agent, fx) = agent_with(
            ScriptedModel::new(["Done."]).with_upload(true),
            ScriptedInput::new(),
            quiet(),
        );
        let mut agent = agent.with_max_token_count(50);

        agent.run("task").await;

        let prompts = fx.model.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].starts_with(UPLOAD_SEED));
        let uploads = fx.model.uploads();
        assert_eq!(uploads.len(), 1);
        assert!(uploads[0].contains("task"));
    }

    #[tokio::test]
    async fn clear_keeps_user_data() {
        let (mut agent, fx) = agent_with(ScriptedModel::new(Vec::<String>::new()), ScriptedInput::new(), quiet());
        agent.session_mut().set_user_data("ticket", serde_json::json!("T-1"));
        agent.set_addon_prompt("pending addon");

        agent.clear().await;

        assert_eq!(agent.session().get_user_data("ticket"), Some(&serde_json::json!("T-1")));
        assert!(agent.session().addon_prompt.is_empty());
        assert_eq!(fx.model.reset_count(), 1);
    }

    #[tokio::test]
    async fn clear_directive_skips_the_model() {
        let (mut agent, fx) = agent_with(ScriptedModel::new(Vec::<String>::new()), ScriptedInput::new(), quiet());
        agent.session_mut().set_user_data("k", serde_json::json!(1));

        let outcome = agent.run("'<Clear>'").await;

        assert_eq!(outcome, RunOutcome::Completed("Task completed".into()));
        assert_eq!(fx.model.call_count(), 0);
        assert_eq!(fx.model.reset_count(), 1);
        assert!(agent.session().get_user_data("k").is_some());
    }

    #[tokio::test]
    async fn summary_directive_seed_leads_next_input() {
        let (mut agent, fx) = agent_with(
            ScriptedModel::new(["first", "the summary", "second"]),
            ScriptedInput::new().answers(["'<Summary>'", "next step", ""]),
            quiet(),
        );

        agent.run("start").await;

        let prompts = fx.model.prompts();
        assert_eq!(prompts.len(), 3);
        assert_eq!(prompts[1], SUMMARY_REQUEST_PROMPT);
        assert!(prompts[2].starts_with(&prompts::summary_seed("the summary")));
        assert!(prompts[2].contains("\n\nnext step\n\n"));
    }

    #[tokio::test]
    async fn tool_usage_directive_replaces_addon() {
        let (mut agent, fx) = agent_with(ScriptedModel::new(["ok"]), ScriptedInput::new(), quiet());
        agent.run("'<ToolUsage>'").await;

        let prompt = &fx.model.prompts()[0];
        assert!(prompt.contains("<actions>"));
        assert!(!prompt.contains("Please continue."));
    }

    #[tokio::test]
    async fn completion_marker_ends_the_run() {
        let settings = AgentSettings {
            auto_complete: true,
            ..quiet()
        };
        let (mut agent, fx) = agent_with(
            ScriptedModel::new(["All done <!!!COMPLETE!!!>"]),
            ScriptedInput::new(),
            settings,
        );

        let outcome = agent.run("task").await;

        assert_eq!(outcome, RunOutcome::Completed("Task completed".into()));
        assert!(fx.model.prompts()[0].contains("<!!!COMPLETE!!!>"));
        assert!(fx.human.asked().is_empty());
    }

    #[tokio::test]
    async fn marker_is_ignored_without_auto_complete() {
        let (mut agent, fx) = agent_with(ScriptedModel::new(["done <!!!COMPLETE!!!>"]), ScriptedInput::new(), quiet());
        agent.run("task").await;
        assert_eq!(fx.human.asked().len(), 1);
    }

    #[tokio::test]
    async fn model_failure_fails_the_run() {
        let (mut agent, _) = agent_with(ScriptedModel::new(Vec::<String>::new()), ScriptedInput::new(), quiet());
        match agent.run("task").await {
            RunOutcome::Failed(text) => assert!(text.starts_with("Task failed: ")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn terminating_handler_returns_result() {
        let (agent, fx) = agent_with(ScriptedModel::new(["<END>"]), ScriptedInput::new(), quiet());
        let mut agent = agent.with_handler(Arc::new(EndHandler(ActionResult::Text("bye".into()))));

        assert_eq!(agent.run("task").await, RunOutcome::Completed("bye".into()));
        assert!(fx.human.asked().is_empty());

        let message = RoutedMessage {
            to: "other".into(),
            content: "hi".into(),
        };
        let (agent, _) = agent_with(ScriptedModel::new(["<END>"]), ScriptedInput::new(), quiet());
        let mut agent = agent.with_handler(Arc::new(EndHandler(ActionResult::Message(message.clone()))));
        assert_eq!(agent.run("task").await, RunOutcome::Routed(message));
    }

    #[tokio::test]
    async fn after_action_hook_sees_session() {
        let (agent, fx) = agent_with(
            ScriptedModel::new([echo_call("a"), "ok".to_string()]),
            ScriptedInput::new(),
            quiet(),
        );
        let mut agent = agent.with_after_action(Box::new(|handler: &str, session: &mut Session| {
            session.addon_prompt = format!("ran {handler}");
            Ok(())
        }));

        agent.run("task").await;

        assert!(fx.model.prompts()[1].ends_with("\n\nran TOOL_CALL"));
    }

    #[tokio::test]
    async fn after_action_hook_error_fails_the_run() {
        let (agent, _) = agent_with(ScriptedModel::new([echo_call("a")]), ScriptedInput::new(), quiet());
        let mut agent = agent.with_after_action(Box::new(|_: &str, _: &mut Session| Err(Error::Internal("hook broke".into()))));

        match agent.run("task").await {
            RunOutcome::Failed(text) => assert!(text.contains("hook broke")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn declined_execution_produces_no_result() {
        let settings = AgentSettings {
            execute_tool_confirm: true,
            ..quiet()
        };
        let (mut agent, fx) = agent_with(
            ScriptedModel::new([echo_call("a")]),
            ScriptedInput::new().confirmations([false]),
            settings,
        );

        agent.run("task").await;

        assert_eq!(fx.runs.load(Ordering::SeqCst), 0);
        assert_eq!(fx.model.call_count(), 1);
        assert_eq!(fx.human.asked()[0], "Execute TOOL_CALL?");
    }

    #[tokio::test]
    async fn completion_runs_analysis_and_summary() {
        let (mut agent, fx) = agent_with(
            ScriptedModel::new(["Done.", "Nothing to add.", "Final report"]),
            ScriptedInput::new().answers(["", "too slow"]).confirmations([false]),
            AgentSettings {
                use_methodology: false,
                ..AgentSettings::default()
            },
        );

        let outcome = agent.run("task").await;

        assert_eq!(outcome, RunOutcome::Completed("Final report".into()));
        let prompts = fx.model.prompts();
        assert!(prompts[1].starts_with(prompts::TASK_ANALYSIS_PROMPT));
        assert!(prompts[1].ends_with("Feedback:\ntoo slow"));
        assert_eq!(prompts[2], DEFAULT_SUMMARY_PROMPT);
    }

    #[tokio::test]
    async fn analysis_acts_until_plain_answer() {
        let (mut agent, fx) = agent_with(
            ScriptedModel::new([
                "Done.".to_string(),
                echo_call("lesson"),
                "That is all.".to_string(),
            ]),
            ScriptedInput::new(),
            AgentSettings {
                need_summary: false,
                use_methodology: false,
                ..AgentSettings::default()
            },
        );

        let outcome = agent.run("task").await;

        assert_eq!(outcome, RunOutcome::Completed("Task completed".into()));
        assert_eq!(fx.runs.load(Ordering::SeqCst), 1);
        assert!(fx.model.prompts()[2].starts_with("stdout:\nlesson"));
        assert!(fx.model.prompts()[1].contains("The user is satisfied"));
    }

    #[tokio::test]
    async fn analysis_stops_at_round_limit() {
        let calls = vec![echo_call("again"); 3];
        let (mut agent, fx) = agent_with(
            ScriptedModel::new(std::iter::once("Done.".to_string()).chain(calls)),
            ScriptedInput::new(),
            AgentSettings {
                need_summary: false,
                use_methodology: false,
                max_analysis_rounds: 2,
                ..AgentSettings::default()
            },
        );

        agent.run("task").await;

        assert_eq!(fx.runs.load(Ordering::SeqCst), 2);
        assert_eq!(fx.model.remaining(), 1);
    }

    #[tokio::test]
    async fn summary_failure_still_completes() {
        let (mut agent, _) = agent_with(
            ScriptedModel::new(["Done."]),
            ScriptedInput::new(),
            AgentSettings {
                use_analysis: false,
                use_methodology: false,
                ..AgentSettings::default()
            },
        );
        assert_eq!(agent.run("task").await, RunOutcome::Completed("Task completed".into()));
    }

    #[tokio::test]
    async fn first_run_appends_local_methodology() {
        let (agent, fx) = agent_with(
            ScriptedModel::new(["ok"]),
            ScriptedInput::new(),
            AgentSettings {
                use_methodology: true,
                ..quiet()
            },
        );
        let mut agent = agent.with_methodology(MethodologyLibrary::from_entries([(
            "fix flaky test",
            "rerun with logging",
        )]));

        agent.run("fix the flaky test").await;

        let prompt = &fx.model.prompts()[0];
        assert!(prompt.starts_with("fix the flaky test\n\nBelow are past experiences"));
        assert!(prompt.contains("Methodology: rerun with logging"));
    }

    #[tokio::test]
    async fn extra_files_disable_methodology() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("context.txt");
        std::fs::write(&file, "context").unwrap();

        let (agent, fx) = agent_with(
            ScriptedModel::new(["ok"]).with_upload(true),
            ScriptedInput::new(),
            AgentSettings {
                use_methodology: true,
                ..quiet()
            },
        );
        let mut agent = agent
            .with_methodology(MethodologyLibrary::from_entries([("p", "m")]))
            .with_files(vec![file]);

        agent.run("task").await;

        assert_eq!(fx.model.uploads(), vec!["context".to_string()]);
        assert!(!fx.model.prompts()[0].contains("Methodology: m"));
        assert!(fx.model.prompts()[0].contains("uploaded files"));
    }

    #[tokio::test]
    async fn files_are_listed_when_upload_is_unsupported() {
        let (agent, fx) = agent_with(ScriptedModel::new(["ok"]), ScriptedInput::new(), quiet());
        let mut agent = agent.with_files(vec![PathBuf::from("docs/design.md")]);

        agent.run("task").await;

        assert!(fx.model.uploads().is_empty());
        assert!(fx.model.prompts()[0].starts_with("task\n\nFiles relevant to this task"));
        assert!(fx.model.prompts()[0].contains("- docs/design.md"));
    }

    #[tokio::test]
    async fn first_run_lists_memory_tags() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new(dir.path().join("p"), dir.path().join("g")));
        store
            .save(MemoryType::GlobalLongTerm, vec!["rust".into(), "style".into()], "prefer iterators")
            .await
            .unwrap();

        let (agent, fx) = agent_with(ScriptedModel::new(["ok"]), ScriptedInput::new(), quiet());
        let mut agent = agent.with_memory(store);

        agent.run("task").await;

        let prompt = &fx.model.prompts()[0];
        assert!(prompt.contains("use retrieve_memory"));
        assert!(prompt.contains("- global_long_term: rust, style"));
    }

    #[tokio::test]
    async fn run_finished_event_is_published() {
        let (agent, _) = agent_with(ScriptedModel::new(["ok"]), ScriptedInput::new(), quiet());
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let mut agent = agent.with_event_bus(bus);

        agent.run("task").await;

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        match last.as_deref() {
            Some(DomainEvent::RunFinished { outcome, .. }) => assert_eq!(outcome, "completed"),
            other => panic!("unexpected last event: {other:?}"),
        }
    }
}
