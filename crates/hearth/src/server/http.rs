//! HTTP surface of the relay daemon
//!
//! Streaming endpoints answer with `application/x-ndjson`, one JSON event
//! per line, and carry the stream id in the `x-hearth-stream` header.

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use dashmap::DashMap;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::ndjson::{RecordingSink, ndjson_response};
use crate::backend::{DualTimeoutTransport, OllamaClient};
use crate::config::Config;
use crate::error::{HearthError, Result};
use crate::progress::BulkPullJob;
use crate::stream::{RelayOutcome, RelayRequest, StreamRelay};
use crate::vault::{
    ChatMessage, ConversationLog, KeyManager, RecordStore, UsageStats, validate_record_name,
};

/// Collection holding conversation records
pub const CONVERSATIONS: &str = "conversations";

const EVENT_BUFFER: usize = 64;

/// Shared application state for all handlers
pub struct AppState {
    pub config: Config,
    pub client: OllamaClient,
    pub relay: StreamRelay,
    pub store: RecordStore,
    /// Cancellation handles of the streams currently being served
    pub streams: DashMap<Uuid, CancellationToken>,
}

impl AppState {
    pub fn new(config: Config, keys: &KeyManager) -> Result<Self> {
        let transport = Arc::new(DualTimeoutTransport::new(&config.backend)?);
        let store = RecordStore::new(config.vault.records_dir(), keys.codec());
        Ok(Self {
            client: OllamaClient::new(Arc::clone(&transport)),
            relay: StreamRelay::new(transport).with_pull_completion(config.pull.completion),
            store,
            streams: DashMap::new(),
            config,
        })
    }

    /// Register a stream and return its id and cancellation handle
    fn register_stream(&self) -> (Uuid, CancellationToken) {
        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        self.streams.insert(id, token.clone());
        (id, token)
    }

    fn cancel_all_streams(&self) {
        for entry in self.streams.iter() {
            entry.value().cancel();
        }
    }
}

/// The relay daemon
pub struct HearthServer {
    state: Arc<AppState>,
}

impl HearthServer {
    pub fn new(state: AppState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    /// Start the server and serve until Ctrl+C or SIGTERM
    pub async fn serve(&self) -> Result<()> {
        let addr: SocketAddr = self
            .state
            .config
            .server
            .listen_addr
            .parse()
            .map_err(|e| HearthError::Config(format!("Invalid listen address: {e}")))?;

        tracing::info!("Starting hearth on {addr}");
        tracing::info!("Backend: {}", self.state.config.backend.base_url);

        let listener = TcpListener::bind(addr).await?;
        let app = create_router(Arc::clone(&self.state));
        let state = Arc::clone(&self.state);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                // Open streams would otherwise hold the shutdown indefinitely
                state.cancel_all_streams();
            })
            .await?;

        tracing::info!("Server shut down gracefully");
        Ok(())
    }
}

/// Create the router with all routes configured
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/models", get(models_handler))
        .route("/api/generate", post(generate_handler))
        .route("/api/chat", post(chat_handler))
        .route("/api/pull", post(pull_handler))
        .route("/api/create", post(create_handler))
        .route("/api/pull-all", post(pull_all_handler))
        .route("/api/streams/{id}", delete(cancel_stream_handler))
        .route("/api/conversations/{id}", get(conversation_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let backend = state.client.is_healthy().await;
    Json(serde_json::json!({"status": "ok", "backend": backend}))
}

async fn models_handler(State(state): State<Arc<AppState>>) -> Response<Body> {
    match state.client.list_models().await {
        Ok(models) => Json(serde_json::json!({ "models": models })).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn generate_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Response<Body> {
    relay_response(state, RelayRequest::generate(body), None)
}

async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Json(mut body): Json<Value>,
) -> Response<Body> {
    let conversation = match PendingExchange::take_from(&mut body) {
        Ok(conversation) => conversation,
        Err(e) => return e.into_response(),
    };
    relay_response(state, RelayRequest::chat(body), conversation)
}

async fn pull_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Response<Body> {
    let model = body
        .get("model")
        .or_else(|| body.get("name"))
        .and_then(Value::as_str);
    let Some(model) = model else {
        return create_error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "Request body must name a model",
        );
    };
    relay_response(state, RelayRequest::pull(model), None)
}

async fn create_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Response<Body> {
    if body.get("model").and_then(Value::as_str).is_none() {
        return create_error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "Request body must name the model to create",
        );
    }
    relay_response(state, RelayRequest::create(body), None)
}

async fn pull_all_handler(State(state): State<Arc<AppState>>) -> Response<Body> {
    let (id, token) = state.register_stream();
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let job = BulkPullJob::new(
        state.client.clone(),
        state.relay.clone(),
        &state.config.pull,
    );

    let task_state = Arc::clone(&state);
    let task_token = token.clone();
    tokio::spawn(async move {
        if let Ok(report) = job.run(&tx, &task_token).await {
            tracing::info!(
                succeeded = report.succeeded(),
                failed = report.failed(),
                "Pull-all job finished"
            );
        }
        task_state.streams.remove(&id);
    });

    ndjson_response(id, rx, token)
}

async fn cancel_stream_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response<Body> {
    match state.streams.remove(&id) {
        Some((_, token)) => {
            token.cancel();
            tracing::info!(%id, "Stream cancelled by request");
            StatusCode::NO_CONTENT.into_response()
        }
        None => create_error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            &format!("No active stream {id}"),
        ),
    }
}

async fn conversation_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response<Body> {
    match state.store.get::<ConversationLog>(CONVERSATIONS, &id).await {
        Ok(Some(log)) => Json(log).into_response(),
        Ok(None) => create_error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            &format!("No conversation {id}"),
        ),
        Err(e) => e.into_response(),
    }
}

/// Chat exchange to persist once its relay completes
struct PendingExchange {
    conversation_id: String,
    model: String,
    prompt: Vec<ChatMessage>,
}

impl PendingExchange {
    /// Remove `conversation_id` from a chat body, keeping what is needed to record the exchange
    fn take_from(body: &mut Value) -> Result<Option<Self>> {
        let Some(id) = body
            .as_object_mut()
            .and_then(|obj| obj.remove("conversation_id"))
        else {
            return Ok(None);
        };
        let Some(id) = id.as_str().map(str::to_string) else {
            return Err(HearthError::InvalidRecordName(id.to_string()));
        };

        let model = body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let messages: Vec<ChatMessage> = body
            .get("messages")
            .and_then(Value::as_array)
            .map(|msgs| msgs.iter().filter_map(ChatMessage::from_request).collect())
            .unwrap_or_default();

        // Clients resend the history; only the messages after the last reply are new
        let new_from = messages
            .iter()
            .rposition(|m| m.role == "assistant")
            .map_or(0, |i| i + 1);

        Ok(Some(Self {
            conversation_id: id,
            model,
            prompt: messages[new_from..].to_vec(),
        }))
    }

    async fn persist(
        self,
        store: &RecordStore,
        reply: String,
        usage: Option<UsageStats>,
    ) -> Result<()> {
        let Self {
            conversation_id,
            model,
            prompt,
        } = self;
        store
            .update(CONVERSATIONS, &conversation_id, |log: Option<ConversationLog>| {
                let mut log = log.unwrap_or_else(|| ConversationLog::new(&conversation_id, &model));
                log.append_exchange(prompt, ChatMessage::new("assistant", reply), usage);
                log
            })
            .await
    }
}

/// Run a relay on its own task and stream its events back
fn relay_response(
    state: Arc<AppState>,
    request: RelayRequest,
    exchange: Option<PendingExchange>,
) -> Response<Body> {
    if let Some(exchange) = &exchange {
        // Reject unusable ids before any backend work
        if let Err(e) = validate_record_name(&exchange.conversation_id) {
            return e.into_response();
        }
    }

    let (id, token) = state.register_stream();
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let task_token = token.clone();

    tokio::spawn(async move {
        let kind = request.kind;
        let mut sink = RecordingSink::new(tx);
        let outcome = state.relay.run(request, &mut sink, &task_token).await;
        state.streams.remove(&id);
        tracing::debug!(%id, ?kind, ?outcome, "Stream finished");

        // The body ends when the sink drops, so a client that read the whole
        // stream can read the saved conversation back.
        if let (RelayOutcome::Completed { .. }, Some(exchange)) = (&outcome, exchange) {
            let (reply, usage) = sink.take_reply();
            let conversation = exchange.conversation_id.clone();
            if let Err(e) = exchange.persist(&state.store, reply, usage).await {
                tracing::error!(%conversation, error = %e, "Failed to save conversation");
            }
        }
        drop(sink);
    });

    ndjson_response(id, rx, token)
}

impl IntoResponse for HearthError {
    fn into_response(self) -> Response<Body> {
        let (status, error_type) = match &self {
            HearthError::ConnectionRefused { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "backend_unavailable")
            }
            HearthError::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            HearthError::Http { status, .. } => (
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
                "backend_error",
            ),
            HearthError::InvalidDigestFormat(_)
            | HearthError::DigestMismatch(_)
            | HearthError::InvalidRecordName(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            HearthError::TamperedOrWrongKey
            | HearthError::InvalidKeyFormat(_)
            | HearthError::Config(_)
            | HearthError::Io(_)
            | HearthError::Serialization(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
            HearthError::Network(_) | HearthError::StreamFatal(_) | HearthError::Decode(_) => {
                (StatusCode::BAD_GATEWAY, "backend_error")
            }
        };
        if status.is_server_error() {
            tracing::warn!(error = %self, "Request failed");
        }
        create_error_response(status, error_type, &self.to_string())
    }
}

/// Create a JSON error response
pub fn create_error_response(status: StatusCode, error_type: &str, message: &str) -> Response<Body> {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
        }
    });

    let mut response = Json(body).into_response();
    *response.status_mut() = status;
    response
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pending_exchange_takes_trailing_user_messages() {
        let mut body = json!({
            "model": "llama3",
            "conversation_id": "c1",
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"},
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "again"}
            ]
        });
        let pending = PendingExchange::take_from(&mut body).unwrap().unwrap();
        assert!(body.get("conversation_id").is_none());
        assert_eq!(pending.conversation_id, "c1");
        assert_eq!(pending.model, "llama3");
        let contents: Vec<&str> = pending.prompt.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["be brief", "again"]);
    }

    #[test]
    fn test_pending_exchange_absent() {
        let mut body = json!({"model": "llama3", "messages": []});
        assert!(PendingExchange::take_from(&mut body).unwrap().is_none());
    }

    #[test]
    fn test_pending_exchange_rejects_non_string_id() {
        let mut body = json!({"conversation_id": 5});
        assert!(matches!(
            PendingExchange::take_from(&mut body),
            Err(HearthError::InvalidRecordName(_))
        ));
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (
                HearthError::ConnectionRefused {
                    url: "http://x".to_string(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                HearthError::Timeout {
                    budget: "standard",
                    after_ms: 1,
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                HearthError::Http {
                    status: 404,
                    body: "missing".to_string(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                HearthError::InvalidRecordName("..".to_string()),
                StatusCode::BAD_REQUEST,
            ),
            (HearthError::Network("reset".to_string()), StatusCode::BAD_GATEWAY),
        ];
        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }
}
