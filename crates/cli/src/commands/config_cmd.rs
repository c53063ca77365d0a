//! `taskloop config` — Configuration management commands.

use std::path::Path;

use taskloop_config::{AppConfig, ConfigError};

pub fn show(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

pub fn path(path: &Path) {
    println!("{}", path.display());
}

pub fn validate(loaded: Result<AppConfig, ConfigError>) {
    println!("🔍 Validating configuration...");

    match loaded {
        Ok(config) => {
            println!("   ✅ Config parsed successfully");
            println!();
            println!("   Request timeout:  {}ms", config.task.request_timeout_ms);
            println!("   Retry attempts:   {}", config.task.max_retry_attempts);
            println!("   Mistake limit:    {}", config.task.mistake_limit);
            println!("   Completion tool:  {}", config.task.completion_tool);
            println!("   No-tools policy:  {:?}", config.task.no_tools_policy);
            println!("   Log level:        {}", config.logging.level);
        }
        Err(e) => {
            println!("   ❌ Config error: {e}");
        }
    }
}

pub fn init(path: &Path, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    if path.exists() && !force {
        return Err(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )
        .into());
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, AppConfig::default_toml())?;
    println!("✅ Wrote default config to {}", path.display());
    Ok(())
}
