use std::collections::HashMap;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use hearth::backend::{DualTimeoutTransport, OllamaClient};
use hearth::config::Config;
use hearth::progress::{BulkPullEvent, BulkPullJob, ItemStatus};
use hearth::stream::StreamRelay;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::CliResult;
use crate::output::{OutputFormat, format_size, truncate_string};

#[derive(Parser)]
pub struct ModelsCommand {
    #[clap(subcommand)]
    pub command: ModelsSubcommand,
}

#[derive(Subcommand)]
pub enum ModelsSubcommand {
    #[clap(about = "List installed models")]
    List,

    #[clap(about = "List models currently loaded in memory")]
    Running,

    #[clap(about = "Re-pull every installed model")]
    PullAll(PullAllArgs),
}

#[derive(Parser)]
pub struct PullAllArgs {
    #[clap(long, help = "Number of pulls in flight at once (overrides pull.concurrency)")]
    pub concurrency: Option<usize>,
}

impl ModelsCommand {
    pub async fn execute(&self, config: &Config, format: OutputFormat) -> CliResult<()> {
        let transport = Arc::new(DualTimeoutTransport::new(&config.backend)?);
        let client = OllamaClient::new(Arc::clone(&transport));

        match &self.command {
            ModelsSubcommand::List => Self::list(&client, format).await,
            ModelsSubcommand::Running => Self::running(&client, format).await,
            ModelsSubcommand::PullAll(args) => {
                let mut pull = config.pull.clone();
                if let Some(n) = args.concurrency {
                    pull.concurrency = n;
                }
                let relay = StreamRelay::new(transport).with_pull_completion(pull.completion);
                let job = BulkPullJob::new(client, relay, &pull);
                Self::pull_all(job, format).await
            }
        }
    }

    async fn list(client: &OllamaClient, format: OutputFormat) -> CliResult<()> {
        let models = client.list_models().await?;

        match format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&models)?);
            }
            OutputFormat::Table => {
                if models.is_empty() {
                    println!("No models installed.");
                    return Ok(());
                }

                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(["Name", "Size", "Digest", "Modified"]);

                for model in &models {
                    table.add_row([
                        model.name.clone(),
                        model.size.map(format_size).unwrap_or_default(),
                        model
                            .digest
                            .as_deref()
                            .map(|d| truncate_string(d, 15))
                            .unwrap_or_default(),
                        model
                            .modified_at
                            .as_deref()
                            .map(|m| truncate_string(m, 19))
                            .unwrap_or_default(),
                    ]);
                }

                println!("{table}");
                println!("\n{} model(s)", models.len());
            }
        }

        Ok(())
    }

    async fn running(client: &OllamaClient, format: OutputFormat) -> CliResult<()> {
        let models = client.running_models().await?;

        match format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&models)?);
            }
            OutputFormat::Table => {
                if models.is_empty() {
                    println!("No models loaded.");
                    return Ok(());
                }

                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(["Name", "Size", "VRAM", "Expires"]);

                for model in &models {
                    table.add_row([
                        model.name.clone(),
                        model.size.map(format_size).unwrap_or_default(),
                        model.size_vram.map(format_size).unwrap_or_default(),
                        model.expires_at.clone().unwrap_or_default(),
                    ]);
                }

                println!("{table}");
            }
        }

        Ok(())
    }

    async fn pull_all(job: BulkPullJob, format: OutputFormat) -> CliResult<()> {
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let ctrl_c = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                ctrl_c.cancel();
            }
        });

        let runner = tokio::spawn(async move { job.run(&tx, &cancel).await });

        let mut display = PullDisplay::new();
        while let Some(event) = rx.recv().await {
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string(&event)?),
                OutputFormat::Table => display.apply(&event)?,
            }
        }

        let report = runner
            .await
            .map_err(|e| format!("Pull-all task failed: {e}"))??;

        if report.failed() > 0 {
            return Err(format!("{} of {} pulls failed", report.failed(), report.items.len()).into());
        }
        Ok(())
    }
}

/// Progress bars for a pull-all job
struct PullDisplay {
    multi: MultiProgress,
    overall: Option<ProgressBar>,
    items: HashMap<usize, ProgressBar>,
}

impl PullDisplay {
    fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            overall: None,
            items: HashMap::new(),
        }
    }

    fn apply(&mut self, event: &BulkPullEvent) -> CliResult<()> {
        match event {
            BulkPullEvent::JobStarted { total } => {
                let pb = self.multi.add(ProgressBar::new(*total as u64));
                let style = ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} models")
                    .map_err(|e| format!("Progress bar error: {e}"))?
                    .progress_chars("#>-");
                pb.set_style(style);
                self.overall = Some(pb);
            }
            BulkPullEvent::ItemStarting {
                model,
                current,
                total,
            } => {
                let pb = self.multi.add(ProgressBar::new(100));
                let style = ProgressStyle::default_bar()
                    .template("{spinner:.green} {prefix} [{bar:30.green/white}] {percent:>3}% {msg}")
                    .map_err(|e| format!("Progress bar error: {e}"))?
                    .progress_chars("#>-");
                pb.set_style(style);
                pb.set_prefix(format!("({current}/{total}) {model}"));
                self.items.insert(*current, pb);
            }
            BulkPullEvent::ItemProgress {
                current,
                stage,
                percent,
                ..
            } => {
                if let Some(pb) = self.items.get(current) {
                    pb.set_message(stage.clone());
                    match percent {
                        Some(p) => pb.set_position(u64::from(*p)),
                        None => pb.tick(),
                    }
                }
            }
            BulkPullEvent::ItemFinished {
                model,
                current,
                total,
                status,
            } => {
                if let Some(pb) = self.items.remove(current) {
                    pb.finish_and_clear();
                    self.multi.remove(&pb);
                }
                let line = match status {
                    ItemStatus::Success => format!("✓ ({current}/{total}) {model}"),
                    ItemStatus::Error { cause } => format!("✗ ({current}/{total}) {model}: {cause}"),
                    ItemStatus::Cancelled => format!("- ({current}/{total}) {model}: cancelled"),
                };
                self.multi.println(line)?;
                if let Some(overall) = &self.overall {
                    overall.inc(1);
                }
            }
            BulkPullEvent::JobCompleted {
                succeeded,
                failed,
                cancelled,
            } => {
                if let Some(overall) = self.overall.take() {
                    overall.finish();
                }
                println!("\n{succeeded} succeeded, {failed} failed, {cancelled} cancelled");
            }
            BulkPullEvent::JobFailed { cause } => {
                println!("Could not start pull-all: {cause}");
            }
        }
        Ok(())
    }
}
