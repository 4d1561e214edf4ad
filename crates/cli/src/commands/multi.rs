//! `turnstile multi`: a team of agents relaying messages.

use std::path::PathBuf;
use tracing::info;
use turnstile_agent::{MultiAgent, prompts};
use turnstile_config::MultiAgentConfig;
use turnstile_core::error::Error;

use super::{CommandResult, report};
use crate::console::install_interrupt_handler;
use crate::setup::{AgentSpec, Runtime};

pub async fn run(profiles: PathBuf, task: Option<String>) -> CommandResult {
    let runtime = Runtime::load()?;
    let team_config = MultiAgentConfig::load_from(&profiles)?;
    install_interrupt_handler(runtime.interrupt.clone());

    let mut team = MultiAgent::from_config(&team_config, &runtime.config.agent, |profile| {
        runtime
            .agent(&AgentSpec {
                name: &profile.name,
                model: profile.model.as_deref(),
                max_token_count: profile.max_token_count,
                use_tools: &profile.use_tools,
            })
            .map_err(|e| Error::Config {
                message: format!("agent '{}': {e}", profile.name),
            })
    })?;
    info!(agents = ?team.agent_names(), main = %team_config.main_agent, "Team assembled");

    let task = match task {
        Some(task) => task,
        None => {
            runtime
                .human
                .ask(&prompts::next_input_question(&team_config.main_agent))
                .await
        }
    };
    if task.trim().is_empty() {
        eprintln!("Nothing to do.");
        return Ok(0);
    }

    Ok(report(team.run(&task).await))
}
