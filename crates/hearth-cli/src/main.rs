use std::path::PathBuf;

use clap::{Parser, Subcommand};
use hearth::config::Config;
use hearth_cli::commands::{ConfigCommand, ModelsCommand, VaultCommand};
use hearth_cli::error::CliResult;
use hearth_cli::output::OutputFormat;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "hearth-cli")]
#[command(about = "Hearth CLI - Models, bulk pulls and the encrypted vault")]
#[command(version)]
pub struct Cli {
    #[clap(long, short, global = true, help = "Output in JSON format")]
    pub json: bool,

    #[clap(long, short = 'c', global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    #[clap(about = "Backend model commands")]
    Models(ModelsCommand),

    #[clap(about = "Encryption key and record store commands")]
    Vault(VaultCommand),

    #[clap(about = "Configuration commands")]
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> CliResult<()> {
    init_logging();

    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Table
    };

    let mut config = Config::load(cli.config.as_deref())?;
    config.apply_env()?;

    match &cli.command {
        Command::Models(cmd) => cmd.execute(&config, format).await,
        Command::Vault(cmd) => cmd.execute(&config, format).await,
        Command::Config(cmd) => cmd.execute(&config, format).await,
    }
}

/// Library logs go to stderr so they never mix with command output
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
