//! `turnstile tools`: what the agent would be offered.

use turnstile_config::AppConfig;

use super::CommandResult;
use crate::setup::{AgentSpec, Runtime};

pub async fn run() -> CommandResult {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let external_dir = config.external_tools_dir();
    let runtime = Runtime::with_config(config)?;
    let dispatcher = runtime.dispatcher(&AgentSpec {
        name: "main",
        ..AgentSpec::default()
    });

    println!("Tools ({}):", dispatcher.registry().len());
    for def in dispatcher.registry().definitions() {
        let summary = def.description.lines().next().unwrap_or_default();
        println!("  {:<18} {summary}", def.name);
    }
    println!();
    println!("External manifests are read from {}", external_dir.display());
    Ok(0)
}
