//! Events produced by a relayed stream

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One event of a relayed stream, in temporal order
///
/// Every stream ends with exactly one terminal event: `Done`, `Error` or
/// `Cancelled`. Nothing follows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A generate/chat frame, forwarded as received
    Chunk { payload: Value },
    /// A pull/create progress frame
    Progress {
        stage: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        digest: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        completed: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total: Option<u64>,
        /// None when either byte count is unknown
        #[serde(default, skip_serializing_if = "Option::is_none")]
        percent: Option<u8>,
    },
    Done,
    Error { cause: String },
    /// Acknowledges a caller-requested abort
    Cancelled,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::Done | StreamEvent::Error { .. } | StreamEvent::Cancelled
        )
    }
}

/// Lifecycle of a single relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Connecting,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

/// How a relay ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// `premature_close` is set when the connection ended before a terminal
    /// frame was seen; the relay still reports success in that case.
    Completed { frames: usize, premature_close: bool },
    Failed { cause: String },
    Cancelled,
}

impl RelayOutcome {
    pub fn state(&self) -> RelayState {
        match self {
            RelayOutcome::Completed { .. } => RelayState::Completed,
            RelayOutcome::Failed { .. } => RelayState::Failed,
            RelayOutcome::Cancelled => RelayState::Cancelled,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RelayOutcome::Completed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_terminal_events() {
        assert!(StreamEvent::Done.is_terminal());
        assert!(StreamEvent::Cancelled.is_terminal());
        assert!(
            StreamEvent::Error {
                cause: "x".to_string()
            }
            .is_terminal()
        );
        assert!(!StreamEvent::Chunk { payload: json!({}) }.is_terminal());
    }

    #[test]
    fn test_wire_format_is_tagged() {
        let event = StreamEvent::Progress {
            stage: "downloading".to_string(),
            digest: None,
            completed: Some(50),
            total: Some(100),
            percent: Some(50),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"type": "progress", "stage": "downloading", "completed": 50, "total": 100, "percent": 50})
        );
        assert_eq!(serde_json::to_value(StreamEvent::Done).unwrap(), json!({"type": "done"}));

        let back: StreamEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_outcome_state() {
        let outcome = RelayOutcome::Completed {
            frames: 2,
            premature_close: false,
        };
        assert_eq!(outcome.state(), RelayState::Completed);
        assert!(outcome.is_success());
        assert_eq!(RelayOutcome::Cancelled.state(), RelayState::Cancelled);
        assert!(
            !RelayOutcome::Failed {
                cause: "x".to_string()
            }
            .is_success()
        );
    }
}
