//! `turnstile run`: one agent, one task.

use std::path::PathBuf;
use tracing::info;
use turnstile_agent::prompts;

use super::{CommandResult, report};
use crate::console::install_interrupt_handler;
use crate::setup::{AgentSpec, Runtime};

const AGENT_NAME: &str = "main";

pub async fn run(task: Option<String>, files: Vec<PathBuf>, confirm: bool) -> CommandResult {
    let mut runtime = Runtime::load()?;
    if confirm {
        runtime.config.agent.execute_tool_confirm = true;
    }
    install_interrupt_handler(runtime.interrupt.clone());

    let mut agent = runtime
        .agent(&AgentSpec {
            name: AGENT_NAME,
            ..AgentSpec::default()
        })?
        .with_files(files);

    let task = match task {
        Some(task) => task,
        None => {
            runtime
                .human
                .ask(&prompts::next_input_question(AGENT_NAME))
                .await
        }
    };
    if task.trim().is_empty() {
        eprintln!("Nothing to do.");
        return Ok(0);
    }

    info!(model = %runtime.config.model.model, "Starting run");
    Ok(report(agent.run(&task).await))
}
