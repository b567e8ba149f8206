use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;
mod remote;

use commands::{auto_sync, ConfigCommand, MealCommand, MealSubcommand, Session, SyncCommand};
use config::Config;

#[derive(Parser)]
#[command(name = "meals")]
#[command(version)]
#[command(about = "Log meals offline and sync them when the server is reachable", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Log and review meals
    Meal(MealCommand),

    /// Sync with remote server
    Sync(SyncCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Save config path for config commands
    let cli_config_path = cli.config.clone();

    // Load configuration
    let config = Config::load(cli.config)?;

    match &cli.command {
        Some(Commands::Meal(cmd)) => {
            let session = Session::open(&config).await?;
            let result = cmd.run(&session.repo).await;

            // Auto-sync AFTER write commands (only if command succeeded)
            if result.is_ok()
                && is_write_command(&cli.command)
                && config.sync.auto_sync
                && config.sync.is_configured()
            {
                auto_sync(&session).await;
            }

            session.close().await;
            result?;
        }
        Some(Commands::Sync(cmd)) => {
            cmd.run(&config).await?;
        }
        Some(Commands::Config(cmd)) => {
            cmd.run(&config, cli_config_path)?;
        }
        None => {
            println!("Use --help to see available commands");
        }
    }

    Ok(())
}

/// Returns true if the command changes the queue and should sync afterwards.
fn is_write_command(cmd: &Option<Commands>) -> bool {
    matches!(
        cmd,
        Some(Commands::Meal(m)) if matches!(m.command,
            MealSubcommand::Log { .. }
            | MealSubcommand::Edit { .. }
            | MealSubcommand::Retry { .. }
            | MealSubcommand::Delete { .. })
    )
}
