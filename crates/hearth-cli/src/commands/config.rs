use clap::{Parser, Subcommand};
use hearth::config::Config;

use crate::error::CliResult;
use crate::output::OutputFormat;

#[derive(Parser)]
pub struct ConfigCommand {
    #[clap(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    #[clap(about = "Show the effective configuration (file plus environment)")]
    Show,
}

impl ConfigCommand {
    pub async fn execute(&self, config: &Config, format: OutputFormat) -> CliResult<()> {
        match &self.command {
            ConfigSubcommand::Show => match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(config)?),
                OutputFormat::Table => {
                    print!("{}", toml::to_string_pretty(config)?);
                    if config.vault.encryption_key.is_some() {
                        println!("\n# vault.encryption_key is set (hidden)");
                    }
                }
            },
        }
        Ok(())
    }
}
