//! `turnstile config`: configuration inspection commands.

use turnstile_config::AppConfig;

use super::CommandResult;

pub async fn show() -> CommandResult {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    if config.model.api_key.is_some() {
        config.model.api_key = Some("********".into());
    }
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(0)
}

pub async fn path() -> CommandResult {
    let config_path = AppConfig::config_dir().join("config.toml");
    println!("{}", config_path.display());
    Ok(0)
}

#[cfg(test)]
mod tests {
    #[test]
    fn config_path_is_valid() {
        let path = turnstile_config::AppConfig::config_dir().join("config.toml");
        assert!(path.to_str().unwrap().ends_with("config.toml"));
    }
}
