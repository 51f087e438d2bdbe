//! NDJSON response bodies fed from relay channels

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::Response;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::stream::{EventSink, SinkError, StreamEvent};
use crate::vault::UsageStats;

/// Response header carrying the id accepted by `DELETE /api/streams/{id}`
pub const STREAM_ID_HEADER: &str = "x-hearth-stream";

/// Cancels the relay when the response body is dropped
struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Stream every received item as one JSON line
///
/// The token is cancelled when the body goes away, which is how a client
/// disconnect reaches the relay. Cancelling after a normal end is a no-op.
pub fn ndjson_response<T>(
    id: Uuid,
    events: mpsc::Receiver<T>,
    cancel: CancellationToken,
) -> Response<Body>
where
    T: Serialize + Send + 'static,
{
    let guard = CancelOnDrop(cancel);
    let lines = ReceiverStream::new(events).map(move |event| {
        let _guard = &guard;
        let mut line = serde_json::to_vec(&event).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to serialize stream event");
            b"{}".to_vec()
        });
        line.push(b'\n');
        Ok::<_, Infallible>(Bytes::from(line))
    });

    let mut response = Response::new(Body::from_stream(lines));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-ndjson"),
    );
    if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
        headers.insert(STREAM_ID_HEADER, value);
    }
    response
}

/// Forwards events to the response while assembling the assistant reply
pub struct RecordingSink {
    tx: mpsc::Sender<StreamEvent>,
    reply: String,
    usage: Option<UsageStats>,
}

impl RecordingSink {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            tx,
            reply: String::new(),
            usage: None,
        }
    }

    /// Take the assembled reply; the response stays open until the sink is dropped
    pub fn take_reply(&mut self) -> (String, Option<UsageStats>) {
        (std::mem::take(&mut self.reply), self.usage.take())
    }

    fn record(&mut self, payload: &Value) {
        let text = payload
            .pointer("/message/content")
            .or_else(|| payload.get("response"))
            .and_then(Value::as_str);
        if let Some(text) = text {
            self.reply.push_str(text);
        }
        if let Some(usage) = UsageStats::from_frame(payload) {
            self.usage = Some(usage);
        }
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(&mut self, event: StreamEvent) -> Result<(), SinkError> {
        if let StreamEvent::Chunk { payload } = &event {
            self.record(payload);
        }
        self.tx.send(event).await.map_err(|_| SinkError::Closed)
    }
}
