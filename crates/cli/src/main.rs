//! coursegen CLI: the main entry point.
//!
//! Commands:
//! - `run`: generate validated lecture content for one topic
//! - `batch`: generate content for many topics concurrently
//! - `config`: initialize, show, or validate configuration
//! - `doctor`: check configuration and backend health

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use coursegen_config::{AppConfig, LoggingConfig};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(
    name = "coursegen",
    about = "coursegen: grounded lecture content from curriculum literature",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ~/.coursegen/config.toml)
    #[arg(long, global = true, env = "COURSEGEN_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate content for one topic
    Run {
        /// Topic request (JSON)
        #[arg(short, long)]
        input: PathBuf,

        /// Corpus directory or JSON file
        #[arg(short, long)]
        corpus: PathBuf,

        /// Write the full artifact as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Generate content for a list of topics
    Batch {
        /// JSON array of topic requests
        #[arg(short, long)]
        input: PathBuf,

        /// Corpus directory or JSON file
        #[arg(short, long)]
        corpus: PathBuf,

        /// Write the batch report as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Check configuration and backend health
    Doctor {
        /// Also check that this corpus loads
        #[arg(long)]
        corpus: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write the default configuration file
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
    /// Print the config file path
    Path,
    /// Validate the config file
    Validate,
}

fn init_tracing(verbose: bool, logging: &LoggingConfig) {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(commands::config_cmd::default_path);

    // Commands that must work with a broken or missing config file.
    match &cli.command {
        Commands::Config { action } if !matches!(action, ConfigAction::Show) => {
            init_tracing(cli.verbose, &LoggingConfig::default());
            return match action {
                ConfigAction::Init { force } => {
                    commands::config_cmd::init(&config_path, *force).await
                }
                ConfigAction::Validate => commands::config_cmd::validate(&config_path),
                _ => {
                    println!("{}", config_path.display());
                    Ok(())
                }
            };
        }
        Commands::Doctor { corpus } => {
            init_tracing(cli.verbose, &LoggingConfig::default());
            return commands::doctor::run(&config_path, corpus.as_deref()).await;
        }
        _ => {}
    }

    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            init_tracing(cli.verbose, &LoggingConfig::default());
            return Err(e.into());
        }
    };
    init_tracing(cli.verbose, &config.logging);

    match cli.command {
        Commands::Run {
            input,
            corpus,
            output,
        } => commands::run::run(&config, &input, &corpus, output.as_deref()).await,
        Commands::Batch {
            input,
            corpus,
            output,
        } => commands::run::batch(&config, &input, &corpus, output.as_deref()).await,
        Commands::Config { .. } => commands::config_cmd::show(&config),
        Commands::Doctor { .. } => Ok(()),
    }
}
