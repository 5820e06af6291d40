//! CLI entry and dispatch.

use anyhow::{Context, Result};
use clap::Parser;
use parley_core::config::{self, RenderMode};
use parley_core::logging;

mod commands;

#[derive(Parser)]
#[command(name = "parley")]
#[command(version)]
#[command(about = "Turn a text buffer into a conversation with a language model")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Override the system prompt from config
    #[arg(long, global = true, value_name = "TEXT")]
    system: Option<String>,
}

/// Options shared by chat sessions.
#[derive(clap::Args, Debug, Clone, Default)]
struct ChatArgs {
    /// Override the model from config
    #[arg(short, long, env = "PARLEY_MODEL")]
    model: Option<String>,

    /// How replies are rendered (plain, org)
    #[arg(long, value_parser = parse_mode)]
    mode: Option<RenderMode>,

    /// Number of past exchanges to send with each request
    #[arg(long, value_name = "N")]
    limit: Option<usize>,

    /// Insert replies at once instead of typing them out
    #[arg(long = "no-playback")]
    no_playback: bool,

    /// Sampling temperature
    #[arg(long)]
    temperature: Option<String>,

    /// Maximum output tokens
    #[arg(long = "max-tokens", value_name = "N")]
    max_tokens: Option<String>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Start an interactive conversation (default)
    Chat {
        #[command(flatten)]
        args: ChatArgs,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Initialize a default config file (if not present)
    Init,
    /// Set a config value (dotted keys reach into tables, e.g. playback.enabled)
    Set {
        #[arg(value_name = "KEY")]
        key: String,
        #[arg(value_name = "VALUE")]
        value: String,
    },
}

fn parse_mode(value: &str) -> Result<RenderMode, String> {
    RenderMode::from_id(value)
        .ok_or_else(|| format!("unknown mode '{value}' (expected plain or org)"))
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    // Logging is best effort; a read-only home must not stop a chat.
    let _log_guard = match logging::init() {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {e:#}");
            None
        }
    };

    // one tokio runtime for everything
    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;
    rt.block_on(async move { dispatch(cli).await })
}

async fn dispatch(cli: Cli) -> Result<()> {
    let Cli { command, system } = cli;

    match command {
        None => chat(&ChatArgs::default(), system.as_deref()).await,
        Some(Commands::Chat { args }) => chat(&args, system.as_deref()).await,
        Some(Commands::Config { command }) => match command {
            ConfigCommands::Path => {
                commands::config::path();
                Ok(())
            }
            ConfigCommands::Init => commands::config::init(),
            ConfigCommands::Set { key, value } => commands::config::set(&key, &value),
        },
    }
}

async fn chat(args: &ChatArgs, system: Option<&str>) -> Result<()> {
    let mut config = config::Config::load().context("load config")?;

    if let Some(sp) = system {
        config.system_prompt = Some(sp.trim().to_string());
        config.system_prompt_file = None;
    }

    commands::chat::run(
        &config,
        &commands::chat::ChatOverrides {
            model: args.model.as_deref(),
            mode: args.mode,
            limit: args.limit,
            no_playback: args.no_playback,
            temperature: args.temperature.as_deref(),
            max_tokens: args.max_tokens.as_deref(),
        },
    )
    .await
}
