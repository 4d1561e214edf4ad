//! `turnstile init`: first-time setup.

use turnstile_config::AppConfig;

use super::CommandResult;

const METHODOLOGY_TEMPLATE: &str = "\
# Problem type -> methodology. Relevant entries are shown to the agent
# before its first turn.
#
# fix failing test: |
#   Reproduce the failure, read the assertion, then change the smallest
#   amount of code that makes it pass.
";

pub async fn run() -> CommandResult {
    let config_dir = AppConfig::config_dir();
    let config_path = config_dir.join("config.toml");

    println!("Turnstile — First-Time Setup");
    println!("============================\n");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
        println!("  Created config directory: {}", config_dir.display());
    } else {
        println!("  Config directory exists: {}", config_dir.display());
    }

    let tools_dir = config_dir.join("tools");
    if !tools_dir.exists() {
        std::fs::create_dir_all(&tools_dir)?;
        println!("  Created external tools directory: {}", tools_dir.display());
    }

    let methodology_path = AppConfig::methodology_path();
    if !methodology_path.exists() {
        std::fs::write(&methodology_path, METHODOLOGY_TEMPLATE)?;
        println!("  Created {}", methodology_path.display());
    }

    if config_path.exists() {
        println!("\n  Config already exists at: {}", config_path.display());
        println!("  Edit it manually or delete it and re-run init.\n");
    } else {
        std::fs::write(&config_path, AppConfig::default_toml())?;
        println!("  Created config.toml at: {}", config_path.display());
        println!("\n  Next steps:");
        println!("   1. Set model.api_key in {} (or TURNSTILE_API_KEY)", config_path.display());
        println!("   2. Run: turnstile run \"describe the task\"\n");
    }

    Ok(0)
}
