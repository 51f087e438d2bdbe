//! Progress aggregation and the pull-all workflow

mod bulk;
mod tracker;

pub use bulk::{BulkPullEvent, BulkPullItem, BulkPullJob, BulkPullReport, ItemStatus};
pub use tracker::{ProgressTracker, ProgressUpdate, PullProgressRecord};
