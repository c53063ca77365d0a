//! TaskLoop CLI — the main entry point.
//!
//! Commands:
//! - `replay`  — Run a recorded transcript through the task loop
//! - `config`  — Show, locate, validate or initialize configuration

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use taskloop_config::{AppConfig, ConfigError, LoggingConfig};

mod commands;
mod tools;

#[derive(Parser)]
#[command(
    name = "taskloop",
    about = "TaskLoop — streaming tool-call task engine",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use this config file instead of ~/.taskloop/config.toml
    #[arg(long, global = true, env = "TASKLOOP_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a recorded turn transcript through the task loop
    Replay {
        /// Path to the transcript JSON file
        transcript: PathBuf,

        /// The initial user message
        #[arg(short, long, default_value = "Complete the recorded task.")]
        message: String,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the config file path
    Path,
    /// Validate the configuration
    Validate,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let loaded = load_config(cli.config.as_deref());
    let logging = loaded
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_default();
    init_tracing(&logging, cli.verbose);

    let path = cli
        .config
        .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"));

    match cli.command {
        Commands::Replay {
            transcript,
            message,
        } => commands::replay::run(loaded?, &transcript, message).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show(loaded?)?,
            ConfigAction::Path => commands::config_cmd::path(&path),
            ConfigAction::Validate => commands::config_cmd::validate(loaded),
            ConfigAction::Init { force } => commands::config_cmd::init(&path, force)?,
        },
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<AppConfig, ConfigError> {
    match path {
        Some(path) => {
            let mut config = AppConfig::load_from(path)?;
            config.apply_env_overrides(|key| std::env::var(key).ok())?;
            config.validate()?;
            Ok(config)
        }
        None => AppConfig::load(),
    }
}

fn init_tracing(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
