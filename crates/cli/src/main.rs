mod commands;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, error};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use seedwarden_core::{load_config, validate_config, Config};

/// Config file read when `--config` is not given.
const DEFAULT_CONFIG: &str = "seedwarden.toml";

/// Offline inspector for seedwarden's persisted session state.
#[derive(Debug, Parser)]
#[command(name = "seedwarden", version, about)]
struct Cli {
    /// Configuration file. Defaults to $SEEDWARDEN_CONFIG, then ./seedwarden.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override `session.base_dir` from the configuration.
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    /// Print JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List managed torrents in queue order.
    Queue,
    /// Show every preference with its effective value.
    Prefs,
    /// Show one preference.
    GetPref { name: String },
    /// Store a preference. The value is JSON: `true`, `5`, `1.5`, `[6881, 6891]`.
    SetPref { name: String, value: String },
    /// Load and validate the configuration.
    CheckConfig,
}

fn main() {
    if let Err(e) = run() {
        error!("Fatal error: {:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    // Logs go to stderr so command output stays pipeable.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut config = resolve_config(cli.config.as_deref())?;
    if let Some(base_dir) = cli.base_dir {
        config.session.base_dir = base_dir;
    }
    debug!(base_dir = %config.session.base_dir.display(), "Using state directory");

    let output = match cli.command {
        Command::Queue => commands::queue(&config.session, cli.json)?,
        Command::Prefs => commands::prefs(&config.session, cli.json)?,
        Command::GetPref { name } => commands::get_pref(&config.session, &name, cli.json)?,
        Command::SetPref { name, value } => commands::set_pref(&config.session, &name, &value)?,
        Command::CheckConfig => commands::check_config(&config, cli.json)?,
    };
    println!("{}", output);
    Ok(())
}

/// Load the configuration. A missing default file means defaults; a missing
/// explicit file is an error.
fn resolve_config(explicit: Option<&std::path::Path>) -> Result<Config> {
    let (path, required) = match explicit {
        Some(path) => (path.to_path_buf(), true),
        None => match std::env::var("SEEDWARDEN_CONFIG") {
            Ok(path) => (PathBuf::from(path), true),
            Err(_) => (PathBuf::from(DEFAULT_CONFIG), false),
        },
    };

    if !required && !path.exists() {
        debug!("No {} found, using defaults", DEFAULT_CONFIG);
        return Ok(Config::default());
    }

    let config = load_config(&path)
        .with_context(|| format!("Failed to load config from {:?}", path))?;
    validate_config(&config).context("Configuration validation failed")?;
    Ok(config)
}
