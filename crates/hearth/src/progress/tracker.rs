//! Progress aggregation for a single pull/create target

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::stream::StreamEvent;

/// A progress frame as sent by `/api/pull` and `/api/create`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullProgressRecord {
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// Total bytes of the layer being transferred
    #[serde(default, alias = "bytesTotal", skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    /// Bytes transferred so far
    #[serde(default, alias = "bytesDone", skip_serializing_if = "Option::is_none")]
    pub completed: Option<u64>,
}

impl PullProgressRecord {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            ..Default::default()
        }
    }

    pub fn with_bytes(mut self, completed: u64, total: u64) -> Self {
        self.completed = Some(completed);
        self.total = Some(total);
        self
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    /// `round(completed / total * 100)`, only when both counts are known
    pub fn percent(&self) -> Option<u8> {
        match (self.completed, self.total) {
            (Some(done), Some(total)) if total > 0 => Some(ratio_percent(done, total)),
            _ => None,
        }
    }

    /// Whether this record marks the end of the transfer
    pub fn marks_completion(&self) -> bool {
        if self.status == "success" {
            return true;
        }
        matches!((self.completed, self.total), (Some(done), Some(total)) if total > 0 && done == total)
    }
}

fn ratio_percent(done: u64, total: u64) -> u8 {
    let pct = (done as f64 / total as f64 * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}

/// Snapshot produced for each observed record
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub stage: String,
    pub digest: Option<String>,
    pub completed: Option<u64>,
    pub total: Option<u64>,
    /// Aggregate percentage; None means indeterminate, not zero
    pub percent: Option<u8>,
    /// True on the first completion record only
    pub is_complete: bool,
}

impl From<ProgressUpdate> for StreamEvent {
    fn from(update: ProgressUpdate) -> Self {
        StreamEvent::Progress {
            stage: update.stage,
            digest: update.digest,
            completed: update.completed,
            total: update.total,
            percent: update.percent,
        }
    }
}

/// Aggregates heterogeneous progress records for one target
///
/// Byte counts are summed over every layer seen so far, and the reported
/// percentage never goes backwards when a new layer starts.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    layers: HashMap<String, (u64, u64)>,
    last_percent: Option<u8>,
    completed: bool,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, record: &PullProgressRecord) -> ProgressUpdate {
        let percent = match (record.completed, record.total) {
            (Some(done), Some(total)) if total > 0 => {
                let key = record.digest.clone().unwrap_or_default();
                self.layers.insert(key, (done.min(total), total));
                let (sum_done, sum_total) = self
                    .layers
                    .values()
                    .fold((0u64, 0u64), |(d, t), (ld, lt)| (d + ld, t + lt));
                let aggregate = ratio_percent(sum_done, sum_total);
                let monotonic = self.last_percent.map_or(aggregate, |p| p.max(aggregate));
                self.last_percent = Some(monotonic);
                Some(monotonic)
            }
            _ => None,
        };

        let is_complete = !self.completed && record.marks_completion();
        if is_complete {
            self.completed = true;
        }

        ProgressUpdate {
            stage: record.status.clone(),
            digest: record.digest.clone(),
            completed: record.completed,
            total: record.total,
            percent,
            is_complete,
        }
    }

    /// Last known aggregate percentage
    pub fn percent(&self) -> Option<u8> {
        self.last_percent
    }

    pub fn is_complete(&self) -> bool {
        self.completed
    }
}
