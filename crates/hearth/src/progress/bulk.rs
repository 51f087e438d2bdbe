//! "Pull all models" job
//!
//! The model set is enumerated once when the job starts. Each model is pulled
//! through the relay, reporting `starting` and then a terminal status with
//! 1-based counters. A failed item never stops the items after it, and the
//! job-level completion event is sent only after every item has ended.
//!
//! The worker pool defaults to a single pull in flight so the backend is not
//! asked to load several models at once.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::OllamaClient;
use crate::config::PullConfig;
use crate::error::Result;
use crate::stream::{EventSink, RelayOutcome, RelayRequest, SinkError, StreamEvent, StreamRelay};

/// Terminal status of one item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemStatus {
    Success,
    Error { cause: String },
    Cancelled,
}

/// Events reported while a pull-all job runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BulkPullEvent {
    JobStarted {
        total: usize,
    },
    ItemStarting {
        model: String,
        current: usize,
        total: usize,
    },
    ItemProgress {
        model: String,
        current: usize,
        total: usize,
        stage: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        percent: Option<u8>,
    },
    ItemFinished {
        model: String,
        current: usize,
        total: usize,
        #[serde(flatten)]
        status: ItemStatus,
    },
    JobCompleted {
        succeeded: usize,
        failed: usize,
        cancelled: usize,
    },
    /// The model set could not be enumerated; nothing was pulled
    JobFailed {
        cause: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkPullItem {
    pub model: String,
    pub status: ItemStatus,
}

/// Per-item results in model order
#[derive(Debug, Clone, Default)]
pub struct BulkPullReport {
    pub items: Vec<BulkPullItem>,
}

impl BulkPullReport {
    fn count(&self, pred: impl Fn(&ItemStatus) -> bool) -> usize {
        self.items.iter().filter(|i| pred(&i.status)).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(|s| matches!(s, ItemStatus::Success))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, ItemStatus::Error { .. }))
    }

    pub fn cancelled(&self) -> usize {
        self.count(|s| matches!(s, ItemStatus::Cancelled))
    }
}

/// Re-pulls every locally installed model
#[derive(Debug, Clone)]
pub struct BulkPullJob {
    client: OllamaClient,
    relay: StreamRelay,
    concurrency: usize,
}

impl BulkPullJob {
    pub fn new(client: OllamaClient, relay: StreamRelay, config: &PullConfig) -> Self {
        Self {
            client,
            relay,
            concurrency: config.concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run the job to the end, reporting on `events`
    ///
    /// Fails only if the model list cannot be fetched. Cancelling `cancel`
    /// aborts the pull in flight; remaining items end as `Cancelled`.
    pub async fn run(
        &self,
        events: &mpsc::Sender<BulkPullEvent>,
        cancel: &CancellationToken,
    ) -> Result<BulkPullReport> {
        let models: Vec<String> = match self.client.list_models().await {
            Ok(models) => models.into_iter().map(|m| m.name).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Could not list models for pull-all");
                let _ = events
                    .send(BulkPullEvent::JobFailed {
                        cause: e.to_string(),
                    })
                    .await;
                return Err(e);
            }
        };
        let total = models.len();

        tracing::info!(total, concurrency = self.concurrency, "Starting pull-all job");
        let _ = events.send(BulkPullEvent::JobStarted { total }).await;

        // Cancelled by the caller, or by us once nobody reads the events.
        let job_cancel = cancel.child_token();
        let mut pulls = stream::iter(models.into_iter().enumerate())
            .map(|(index, model)| self.pull_one(model, index + 1, total, events, &job_cancel))
            .buffered(self.concurrency);

        let mut report = BulkPullReport::default();
        while let Some((model, current, status)) = pulls.next().await {
            match &status {
                ItemStatus::Success => tracing::info!(%model, "Pulled model"),
                ItemStatus::Error { cause } => {
                    tracing::warn!(%model, %cause, "Pull failed, continuing with next model")
                }
                ItemStatus::Cancelled => tracing::info!(%model, "Pull cancelled"),
            }
            let _ = events
                .send(BulkPullEvent::ItemFinished {
                    model: model.clone(),
                    current,
                    total,
                    status: status.clone(),
                })
                .await;
            report.items.push(BulkPullItem { model, status });

            if events.is_closed() && !job_cancel.is_cancelled() {
                tracing::info!("Pull-all receiver gone, cancelling remaining pulls");
                job_cancel.cancel();
            }
        }

        let _ = events
            .send(BulkPullEvent::JobCompleted {
                succeeded: report.succeeded(),
                failed: report.failed(),
                cancelled: report.cancelled(),
            })
            .await;

        Ok(report)
    }

    async fn pull_one(
        &self,
        model: String,
        current: usize,
        total: usize,
        events: &mpsc::Sender<BulkPullEvent>,
        cancel: &CancellationToken,
    ) -> (String, usize, ItemStatus) {
        let _ = events
            .send(BulkPullEvent::ItemStarting {
                model: model.clone(),
                current,
                total,
            })
            .await;

        let mut sink = ItemSink {
            model: &model,
            current,
            total,
            events,
            last: None,
        };
        let outcome = self
            .relay
            .run(RelayRequest::pull(&model), &mut sink, cancel)
            .await;

        let status = match outcome {
            RelayOutcome::Completed { .. } => ItemStatus::Success,
            RelayOutcome::Failed { cause } => ItemStatus::Error { cause },
            RelayOutcome::Cancelled => ItemStatus::Cancelled,
        };
        (model, current, status)
    }
}

/// Turns one item's relay events into `ItemProgress` reports
struct ItemSink<'a> {
    model: &'a str,
    current: usize,
    total: usize,
    events: &'a mpsc::Sender<BulkPullEvent>,
    last: Option<(String, Option<u8>)>,
}

#[async_trait]
impl EventSink for ItemSink<'_> {
    async fn emit(&mut self, event: StreamEvent) -> std::result::Result<(), SinkError> {
        let StreamEvent::Progress { stage, percent, .. } = event else {
            return Ok(());
        };

        // Only report when something visible changed.
        let key = (stage, percent);
        if self.last.as_ref() == Some(&key) {
            return Ok(());
        }
        self.last = Some(key.clone());

        self.events
            .send(BulkPullEvent::ItemProgress {
                model: self.model.to_string(),
                current: self.current,
                total: self.total,
                stage: key.0,
                percent: key.1,
            })
            .await
            .map_err(|_| SinkError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_counts() {
        let report = BulkPullReport {
            items: vec![
                BulkPullItem {
                    model: "a".to_string(),
                    status: ItemStatus::Success,
                },
                BulkPullItem {
                    model: "b".to_string(),
                    status: ItemStatus::Error {
                        cause: "boom".to_string(),
                    },
                },
                BulkPullItem {
                    model: "c".to_string(),
                    status: ItemStatus::Success,
                },
            ],
        };
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.cancelled(), 0);
    }

    #[test]
    fn test_item_finished_wire_format() {
        let event = BulkPullEvent::ItemFinished {
            model: "llama3".to_string(),
            current: 1,
            total: 2,
            status: ItemStatus::Error {
                cause: "disk full".to_string(),
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "type": "item_finished",
                "model": "llama3",
                "current": 1,
                "total": 2,
                "status": "error",
                "cause": "disk full"
            })
        );
    }
}
