use clap::{Parser, Subcommand};
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use hearth::config::Config;
use hearth::vault::{EncryptionCodec, KeyManager, RecordStore};

use crate::error::{CliError, CliResult};
use crate::output::OutputFormat;

#[derive(Parser)]
pub struct VaultCommand {
    #[clap(subcommand)]
    pub command: VaultSubcommand,
}

#[derive(Subcommand)]
pub enum VaultSubcommand {
    #[clap(about = "Show where the key comes from and what the store holds")]
    Status,

    #[clap(about = "Encrypt a value with the vault key")]
    Encrypt(ValueArgs),

    #[clap(about = "Decrypt an envelope with the vault key")]
    Decrypt(ValueArgs),

    #[clap(about = "Verify every stored record authenticates under the current key")]
    Check,
}

#[derive(Parser)]
pub struct ValueArgs {
    #[clap(help = "Value to process")]
    pub value: String,
}

impl VaultCommand {
    pub async fn execute(&self, config: &Config, format: OutputFormat) -> CliResult<()> {
        match &self.command {
            VaultSubcommand::Status => Self::status(config, format).await,
            VaultSubcommand::Encrypt(args) => {
                let codec = require_key(config)?.codec();
                print_value(&codec.encrypt(&args.value)?, format)
            }
            VaultSubcommand::Decrypt(args) => {
                let codec = require_key(config)?.codec();
                if !EncryptionCodec::is_encrypted(&args.value) {
                    eprintln!("Note: input is not an envelope, returned unchanged");
                }
                print_value(&codec.decrypt(&args.value)?, format)
            }
            VaultSubcommand::Check => Self::check(config, format).await,
        }
    }

    async fn status(config: &Config, format: OutputFormat) -> CliResult<()> {
        let vault = &config.vault;
        let keys = KeyManager::existing(vault)?;
        let key_source = keys
            .as_ref()
            .map(|k| k.source().to_string())
            .unwrap_or_else(|| "none (generated on first daemon start)".to_string());

        let (collections, records) = match &keys {
            Some(keys) => {
                let store = RecordStore::new(vault.records_dir(), keys.codec());
                let collections = store.collections().await?;
                let mut records = 0;
                for collection in &collections {
                    records += store.list_ids(collection).await?.len();
                }
                (collections.len(), records)
            }
            None => (0, 0),
        };

        match format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "container_mode": vault.is_container(),
                    "data_dir": vault.data_dir,
                    "key_source": key_source,
                    "strict_decrypt": vault.strict_decrypt,
                    "collections": collections,
                    "records": records,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(["Setting", "Value"]);

                let mode = if vault.is_container() {
                    "container"
                } else {
                    "bare process"
                };
                table.add_row(["Mode", mode]);
                table.add_row(["Data dir", &vault.data_dir.display().to_string()]);
                table.add_row(["Key", &key_source]);
                table.add_row(["Strict decrypt", &vault.strict_decrypt.to_string()]);
                table.add_row(["Collections", &collections.to_string()]);
                table.add_row(["Records", &records.to_string()]);

                println!("{table}");
            }
        }

        Ok(())
    }

    async fn check(config: &Config, format: OutputFormat) -> CliResult<()> {
        let keys = require_key(config)?;
        let store = RecordStore::new(config.vault.records_dir(), keys.codec());
        let scan = store.scan().await?;

        match format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "encrypted": scan.encrypted,
                    "legacy": scan.legacy,
                    "unreadable": scan.unreadable,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                println!("Encrypted: {}", scan.encrypted);
                println!("Legacy plaintext: {}", scan.legacy);
                println!("Unreadable: {}", scan.unreadable.len());
                for record in &scan.unreadable {
                    println!("  {record}");
                }
            }
        }

        if scan.unreadable.is_empty() {
            Ok(())
        } else {
            Err(CliError::new(format!(
                "{} record(s) do not authenticate under the current key",
                scan.unreadable.len()
            )))
        }
    }
}

fn require_key(config: &Config) -> CliResult<KeyManager> {
    KeyManager::existing(&config.vault)?.ok_or_else(|| {
        CliError::new(
            "No encryption key found. Start the daemon once or set ENCRYPTION_KEY".to_string(),
        )
    })
}

fn print_value(value: &str, format: OutputFormat) -> CliResult<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::json!({ "value": value })),
        OutputFormat::Table => println!("{value}"),
    }
    Ok(())
}
