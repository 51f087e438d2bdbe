//! Hearth daemon - streaming relay and encrypted conversation vault

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use hearth::config::Config;
use hearth::error::Result;
use hearth::server::{AppState, HearthServer};
use hearth::vault::KeyManager;

/// Hearth - relays a local inference backend and keeps conversations encrypted
#[derive(Parser)]
#[command(name = "hearth")]
#[command(about = "Streaming relay to a local inference backend with an encrypted vault")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the relay server (default command)
    #[command(name = "serve")]
    Serve,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => serve(cli.config).await,
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,hearth=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    tracing::info!("Starting hearth daemon");

    let mut config = Config::load(config_path.as_deref())?;
    config.apply_env()?;
    tracing::debug!(
        backend = %config.backend.base_url,
        data_dir = %config.vault.data_dir.display(),
        container = config.vault.is_container(),
        "Config loaded"
    );

    // A malformed key stops startup here, before anything is encrypted
    let keys = KeyManager::resolve(&config.vault)?;

    let state = AppState::new(config, &keys)?;
    HearthServer::new(state).serve().await?;

    tracing::info!("Hearth daemon stopped");
    Ok(())
}
