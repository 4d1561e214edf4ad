//! Wiring: config → model sessions, tool registry, handlers, agents.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};
use turnstile_agent::{Agent, MethodologyLibrary, ToolDispatcher};
use turnstile_config::AppConfig;
use turnstile_core::event::EventBus;
use turnstile_core::human::HumanInput;
use turnstile_core::interrupt::InterruptSignal;
use turnstile_core::model::ModelService;
use turnstile_providers::OpenAiChat;
use turnstile_tools::{BuiltinTools, MemoryStore, PatchApplier, builtin_registry, register_external};

use crate::console::ConsoleInput;

type BoxError = Box<dyn std::error::Error>;

/// Everything agents in one process share.
pub struct Runtime {
    pub config: AppConfig,
    pub human: Arc<dyn HumanInput>,
    pub interrupt: InterruptSignal,
    pub event_bus: Arc<EventBus>,
    pub memory: Arc<MemoryStore>,
    pub workdir: PathBuf,
}

/// Per-agent choices layered over the shared config.
#[derive(Default)]
pub struct AgentSpec<'a> {
    pub name: &'a str,
    pub model: Option<&'a str>,
    pub max_token_count: Option<usize>,
    pub use_tools: &'a [String],
}

impl Runtime {
    /// Load config and fail early with a readable message when no API key is set.
    pub fn load() -> Result<Self, BoxError> {
        let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
        if !config.has_api_key() {
            eprintln!();
            eprintln!("  ERROR: No API key configured!");
            eprintln!();
            eprintln!("  Set TURNSTILE_API_KEY or OPENAI_API_KEY, or add model.api_key to");
            eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
            eprintln!();
            return Err("No API key found. See above for setup instructions.".into());
        }
        Self::with_config(config)
    }

    pub fn with_config(config: AppConfig) -> Result<Self, BoxError> {
        let workdir = std::env::current_dir()?;
        let memory = Arc::new(MemoryStore::new(
            workdir.join(".turnstile"),
            config.memory_dir(),
        ));
        let event_bus = Arc::new(EventBus::default());
        spawn_event_logger(&event_bus);

        Ok(Self {
            config,
            human: Arc::new(ConsoleInput),
            interrupt: InterruptSignal::new(),
            event_bus,
            memory,
            workdir,
        })
    }

    fn model(&self, model: Option<&str>) -> Result<OpenAiChat, BoxError> {
        let chat = OpenAiChat::from_config(&self.config.model)?;
        Ok(match model {
            Some(name) => chat.with_model(name),
            None => chat,
        })
    }

    /// Built-in plus external tools, filtered by config and `use_tools`.
    pub fn dispatcher(&self, spec: &AgentSpec<'_>) -> ToolDispatcher {
        let mut registry = builtin_registry(BuiltinTools {
            shell_allowlist: self.config.tools.shell_allowlist.clone(),
            human: self.human.clone(),
            memory: Some(self.memory.clone()),
        });
        let external = register_external(&mut registry, &self.config.external_tools_dir());
        debug!(external, "External tools registered");

        let mut dispatcher = ToolDispatcher::new(registry, self.max_token_count(spec))
            .with_event_bus(self.event_bus.clone());
        dispatcher.use_tools(&self.config.tools.use_tools);
        dispatcher.use_tools(spec.use_tools);
        dispatcher.dont_use_tools(&self.config.tools.dont_use_tools);
        dispatcher
    }

    fn max_token_count(&self, spec: &AgentSpec<'_>) -> usize {
        spec.max_token_count.unwrap_or(self.config.model.max_token_count)
    }

    /// A fully wired agent: tools, patches, memory, operator, interrupts.
    pub fn agent(&self, spec: &AgentSpec<'_>) -> Result<Agent, BoxError> {
        let model: Arc<dyn ModelService> = Arc::new(self.model(spec.model)?);
        // Oversized tool output is condensed in a separate session.
        let summarizer: Arc<dyn ModelService> = Arc::new(self.model(spec.model)?);
        let settings = self.config.agent.clone();

        let mut patches = PatchApplier::new(self.workdir.clone());
        if settings.confirm_before_apply_patch {
            patches = patches.with_confirmation(self.human.clone());
        }

        let mut agent = Agent::new(spec.name, model)
            .with_tools(self.dispatcher(spec).with_summarizer(summarizer))
            .with_handler(Arc::new(patches))
            .with_human(self.human.clone())
            .with_interrupt(self.interrupt.clone())
            .with_event_bus(self.event_bus.clone())
            .with_memory(self.memory.clone())
            .with_max_token_count(self.max_token_count(spec))
            .with_settings(settings.clone());

        if settings.use_methodology {
            let library = MethodologyLibrary::load(&AppConfig::methodology_path())?;
            info!(entries = library.len(), "Methodology library loaded");
            agent = agent.with_methodology(library);
        }
        Ok(agent)
    }
}

fn spawn_event_logger(bus: &EventBus) {
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => debug!(?event, "Domain event"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Event logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
