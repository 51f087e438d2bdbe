//! Streaming relay for generate, chat, pull and create
//!
//! A relay opens one long-operation stream to the backend, decodes NDJSON
//! frames as they arrive and forwards typed [`StreamEvent`]s to a sink. It
//! walks `Idle -> Connecting -> Streaming` and ends in exactly one of
//! `Completed`, `Failed` or `Cancelled`. Each data frame is emitted before
//! its completion check so the final payload always precedes `Done`.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::event::{RelayOutcome, RelayState, StreamEvent};
use super::frame::FrameStream;
use crate::backend::DualTimeoutTransport;
use crate::config::PullCompletion;
use crate::error::HearthError;
use crate::progress::{ProgressTracker, PullProgressRecord};

/// Capacity of the channel behind [`StreamRelay::spawn`]
const EVENT_BUFFER: usize = 64;

/// Kind of streaming exchange, which fixes endpoint and completion rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayKind {
    Generate,
    Chat,
    Pull,
    Create,
}

impl RelayKind {
    pub fn path(&self) -> &'static str {
        match self {
            RelayKind::Generate => "/api/generate",
            RelayKind::Chat => "/api/chat",
            RelayKind::Pull => "/api/pull",
            RelayKind::Create => "/api/create",
        }
    }
}

/// A streaming request to relay
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub kind: RelayKind,
    pub body: Value,
}

impl RelayRequest {
    pub fn generate(body: Value) -> Self {
        Self {
            kind: RelayKind::Generate,
            body,
        }
    }

    pub fn chat(body: Value) -> Self {
        Self {
            kind: RelayKind::Chat,
            body,
        }
    }

    pub fn pull(model: &str) -> Self {
        Self {
            kind: RelayKind::Pull,
            body: serde_json::json!({ "model": model }),
        }
    }

    /// Build a model from a request body, streaming its progress
    pub fn create(body: Value) -> Self {
        Self {
            kind: RelayKind::Create,
            body,
        }
    }

    fn into_stream_body(self) -> Value {
        let mut body = self.body;
        match body.as_object_mut() {
            Some(obj) => {
                obj.insert("stream".to_string(), Value::Bool(true));
            }
            None => body = serde_json::json!({ "stream": true }),
        }
        body
    }
}

/// Why a sink refused an event
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Nobody is listening anymore
    #[error("event receiver closed")]
    Closed,
    #[error("sink failed: {0}")]
    Fatal(String),
}

/// Destination for relay events
#[async_trait]
pub trait EventSink: Send {
    async fn emit(&mut self, event: StreamEvent) -> Result<(), SinkError>;
}

#[async_trait]
impl EventSink for mpsc::Sender<StreamEvent> {
    async fn emit(&mut self, event: StreamEvent) -> Result<(), SinkError> {
        self.send(event).await.map_err(|_| SinkError::Closed)
    }
}

#[async_trait]
impl EventSink for Vec<StreamEvent> {
    async fn emit(&mut self, event: StreamEvent) -> Result<(), SinkError> {
        self.push(event);
        Ok(())
    }
}

/// Orchestrates streaming exchanges with the backend
///
/// Relays share nothing mutable; any number may run concurrently.
#[derive(Debug, Clone)]
pub struct StreamRelay {
    transport: Arc<DualTimeoutTransport>,
    pull_completion: PullCompletion,
}

impl StreamRelay {
    pub fn new(transport: Arc<DualTimeoutTransport>) -> Self {
        Self {
            transport,
            pull_completion: PullCompletion::default(),
        }
    }

    /// Choose which progress record ends pull and create streams
    pub fn with_pull_completion(mut self, rule: PullCompletion) -> Self {
        self.pull_completion = rule;
        self
    }

    /// Run a relay on a background task, delivering events over a channel
    pub fn spawn(&self, request: RelayRequest) -> RelayHandle {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();
        let relay = self.clone();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut sink = tx;
            relay.run(request, &mut sink, &token).await
        });

        RelayHandle {
            events: rx,
            cancel,
            task,
        }
    }

    /// Drive one relay to its end
    ///
    /// Returns once a terminal event has been offered to the sink. After
    /// cancellation the sink receives the `Cancelled` acknowledgement and
    /// nothing else.
    pub async fn run<K>(
        &self,
        request: RelayRequest,
        sink: &mut K,
        cancel: &CancellationToken,
    ) -> RelayOutcome
    where
        K: EventSink + ?Sized,
    {
        let kind = request.kind;
        let mut state = RelayState::Idle;

        if cancel.is_cancelled() {
            return acknowledge_cancel(kind, state, sink).await;
        }

        state = transition(kind, state, RelayState::Connecting);
        let body = request.into_stream_body();
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.transport.open_stream(kind.path(), &body) => Some(result),
        };

        let response = match opened {
            None => return acknowledge_cancel(kind, state, sink).await,
            Some(Ok(response)) => response,
            Some(Err(e)) => return fail(kind, state, sink, e.to_string()).await,
        };

        state = transition(kind, state, RelayState::Streaming);
        let mut frames = FrameStream::new(response.bytes_stream().boxed());
        let mut tracker = ProgressTracker::new();
        let mut count = 0usize;

        loop {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = frames.next() => Some(next),
            };
            let Some(next) = polled else {
                // Dropping the body stream closes the connection.
                drop(frames);
                return acknowledge_cancel(kind, state, sink).await;
            };

            match next {
                Some(Ok(frame)) => {
                    count += 1;

                    if let Some(message) = backend_error(&frame) {
                        drop(frames);
                        let cause = HearthError::StreamFatal(message).to_string();
                        return fail(kind, state, sink, cause).await;
                    }

                    let (event, terminal) = match kind {
                        RelayKind::Generate | RelayKind::Chat => {
                            let done = frame.get("done").and_then(Value::as_bool) == Some(true);
                            (StreamEvent::Chunk { payload: frame }, done)
                        }
                        RelayKind::Pull | RelayKind::Create => {
                            pull_event(&mut tracker, frame, self.pull_completion)
                        }
                    };

                    if let Err(e) = sink.emit(event).await {
                        drop(frames);
                        return sink_failure(kind, state, sink, e).await;
                    }

                    if terminal {
                        drop(frames);
                        return complete(kind, state, sink, count, false).await;
                    }
                }
                Some(Err(e)) => {
                    drop(frames);
                    let cause = HearthError::StreamFatal(e.to_string()).to_string();
                    return fail(kind, state, sink, cause).await;
                }
                None => {
                    tracing::warn!(
                        ?kind,
                        frames = count,
                        "Backend closed the stream before a terminal frame; treating as completed"
                    );
                    return complete(kind, state, sink, count, true).await;
                }
            }
        }
    }
}

/// Map a progress frame to an event and tell whether it ends the stream
fn pull_event(
    tracker: &mut ProgressTracker,
    frame: Value,
    rule: PullCompletion,
) -> (StreamEvent, bool) {
    let record: PullProgressRecord = match serde_json::from_value(frame) {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!(error = %e, "Unrecognized progress frame");
            PullProgressRecord::default()
        }
    };
    let update = tracker.observe(&record);
    let terminal = match rule {
        PullCompletion::Progress => update.is_complete,
        PullCompletion::Success => record.status == "success",
    };
    (update.into(), terminal)
}

/// Backends report mid-stream failures as `{"error": "..."}`
fn backend_error(frame: &Value) -> Option<String> {
    frame
        .get("error")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn transition(kind: RelayKind, from: RelayState, to: RelayState) -> RelayState {
    tracing::debug!(?kind, ?from, ?to, "Relay state change");
    to
}

async fn complete<K: EventSink + ?Sized>(
    kind: RelayKind,
    state: RelayState,
    sink: &mut K,
    frames: usize,
    premature_close: bool,
) -> RelayOutcome {
    transition(kind, state, RelayState::Completed);
    if sink.emit(StreamEvent::Done).await.is_err() {
        tracing::debug!(?kind, "Receiver gone before Done was delivered");
    }
    RelayOutcome::Completed {
        frames,
        premature_close,
    }
}

async fn fail<K: EventSink + ?Sized>(
    kind: RelayKind,
    state: RelayState,
    sink: &mut K,
    cause: String,
) -> RelayOutcome {
    transition(kind, state, RelayState::Failed);
    tracing::warn!(?kind, %cause, "Relay failed");
    let _ = sink
        .emit(StreamEvent::Error {
            cause: cause.clone(),
        })
        .await;
    RelayOutcome::Failed { cause }
}

async fn acknowledge_cancel<K: EventSink + ?Sized>(
    kind: RelayKind,
    state: RelayState,
    sink: &mut K,
) -> RelayOutcome {
    transition(kind, state, RelayState::Cancelled);
    let _ = sink.emit(StreamEvent::Cancelled).await;
    RelayOutcome::Cancelled
}

async fn sink_failure<K: EventSink + ?Sized>(
    kind: RelayKind,
    state: RelayState,
    sink: &mut K,
    error: SinkError,
) -> RelayOutcome {
    match error {
        SinkError::Closed => {
            // The consumer went away, which is an implicit cancel.
            transition(kind, state, RelayState::Cancelled);
            RelayOutcome::Cancelled
        }
        SinkError::Fatal(cause) => fail(kind, state, sink, cause).await,
    }
}

/// Handle to a relay running on its own task
pub struct RelayHandle {
    events: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
    task: JoinHandle<RelayOutcome>,
}

impl RelayHandle {
    /// Abort the relay; safe to call any number of times at any point
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn into_parts(
        self,
    ) -> (
        mpsc::Receiver<StreamEvent>,
        CancellationToken,
        JoinHandle<RelayOutcome>,
    ) {
        (self.events, self.cancel, self.task)
    }

    /// Drain every event and wait for the outcome
    pub async fn collect(mut self) -> (Vec<StreamEvent>, RelayOutcome) {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        let outcome = self.task.await.unwrap_or_else(|e| RelayOutcome::Failed {
            cause: format!("relay task panicked: {e}"),
        });
        (events, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stream_body_forces_streaming() {
        let body = RelayRequest::generate(json!({"model": "m", "prompt": "p", "stream": false}))
            .into_stream_body();
        assert_eq!(body["stream"], true);
        assert_eq!(body["prompt"], "p");

        let body = RelayRequest::pull("llama3").into_stream_body();
        assert_eq!(body, json!({"model": "llama3", "stream": true}));
    }

    #[test]
    fn test_paths() {
        assert_eq!(RelayKind::Generate.path(), "/api/generate");
        assert_eq!(RelayKind::Chat.path(), "/api/chat");
        assert_eq!(RelayKind::Pull.path(), "/api/pull");
        assert_eq!(RelayKind::Create.path(), "/api/create");
    }

    #[test]
    fn test_backend_error_detection() {
        assert_eq!(
            backend_error(&json!({"error": "model not found"})),
            Some("model not found".to_string())
        );
        assert_eq!(backend_error(&json!({"response": "hi"})), None);
    }

    #[test]
    fn test_pull_event_ends_on_equal_byte_counts() {
        let mut tracker = ProgressTracker::new();
        let (_, terminal) = pull_event(
            &mut tracker,
            json!({"status": "pulling abc", "digest": "abc", "total": 10, "completed": 4}),
            PullCompletion::Progress,
        );
        assert!(!terminal);

        let (event, terminal) = pull_event(
            &mut tracker,
            json!({"status": "pulling abc", "digest": "abc", "total": 10, "completed": 10}),
            PullCompletion::Progress,
        );
        assert!(terminal);
        assert!(matches!(event, StreamEvent::Progress { percent: Some(100), .. }));
    }

    #[test]
    fn test_pull_event_ends_on_success_status() {
        let mut tracker = ProgressTracker::new();
        let (_, terminal) = pull_event(
            &mut tracker,
            json!({"status": "success"}),
            PullCompletion::Progress,
        );
        assert!(terminal);
    }

    #[test]
    fn test_success_rule_ignores_layer_completion() {
        let mut tracker = ProgressTracker::new();
        let (_, terminal) = pull_event(
            &mut tracker,
            json!({"status": "pulling abc", "digest": "abc", "total": 10, "completed": 10}),
            PullCompletion::Success,
        );
        assert!(!terminal);

        let (_, terminal) = pull_event(
            &mut tracker,
            json!({"status": "success"}),
            PullCompletion::Success,
        );
        assert!(terminal);
    }

    #[tokio::test]
    async fn test_pre_cancelled_run_only_acknowledges() {
        let transport = DualTimeoutTransport::with_timeouts(
            "http://127.0.0.1:9",
            std::time::Duration::from_secs(1),
            std::time::Duration::from_secs(1),
        )
        .unwrap();
        let relay = StreamRelay::new(Arc::new(transport));
        let token = CancellationToken::new();
        token.cancel();

        let mut events: Vec<StreamEvent> = Vec::new();
        let outcome = relay
            .run(RelayRequest::generate(json!({})), &mut events, &token)
            .await;

        assert_eq!(outcome, RelayOutcome::Cancelled);
        assert_eq!(events, vec![StreamEvent::Cancelled]);
    }
}
