//! Outbound HTTP transport with two timeout budgets
//!
//! Every call site names its budget explicitly: `Standard` for metadata and
//! control calls, `LongOperation` for anything that may cold-load a model or
//! move large data. This layer never retries; it only sends, applies the
//! budget, and classifies failures.

use bytes::Bytes;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::config::BackendConfig;
use crate::error::{HearthError, Result};

/// Which timeout budget a call runs under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    /// Listing, show, delete, embeddings, liveness
    Standard,
    /// Generate, chat, pull, push, create
    LongOperation,
}

impl TimeoutClass {
    pub fn label(&self) -> &'static str {
        match self {
            TimeoutClass::Standard => "standard",
            TimeoutClass::LongOperation => "long-operation",
        }
    }
}

/// HTTP transport to the inference backend
#[derive(Debug, Clone)]
pub struct DualTimeoutTransport {
    client: Client,
    base_url: String,
    standard: Duration,
    long: Duration,
}

impl DualTimeoutTransport {
    /// Create a transport from backend configuration
    pub fn new(config: &BackendConfig) -> Result<Self> {
        Self::with_timeouts(
            &config.base_url,
            config.standard_timeout(),
            config.long_timeout(),
        )
    }

    /// Create a transport with explicit budgets
    pub fn with_timeouts(base_url: &str, standard: Duration, long: Duration) -> Result<Self> {
        let parsed = Url::parse(base_url)
            .map_err(|e| HearthError::Config(format!("Invalid backend URL '{base_url}': {e}")))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(HearthError::Config(format!(
                "Unsupported backend URL scheme '{}': only http and https are allowed",
                parsed.scheme()
            )));
        }

        // No client-wide timeout: each request carries its own budget.
        let client = Client::builder()
            .build()
            .map_err(|e| HearthError::Network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            standard,
            long,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The budget a class of call runs under
    pub fn budget(&self, class: TimeoutClass) -> Duration {
        match class {
            TimeoutClass::Standard => self.standard,
            TimeoutClass::LongOperation => self.long,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn builder(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, self.endpoint(path))
    }

    /// Send a request whose whole exchange (including the body) must fit the budget
    pub async fn send(
        &self,
        class: TimeoutClass,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Response> {
        let mut builder = self.builder(method, path).timeout(self.budget(class));
        if let Some(body) = body {
            builder = builder.json(body);
        }
        tracing::debug!(budget = class.label(), "Calling backend {}", path);
        let response = builder
            .send()
            .await
            .map_err(|e| self.classify(e, class))?;
        ensure_success(response).await
    }

    /// Send a request and decode the JSON answer
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        class: TimeoutClass,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<T> {
        let response = self.send(class, method, path, body).await?;
        response
            .json()
            .await
            .map_err(|e| self.classify(e, class))
    }

    /// Send a raw byte body (blob uploads)
    pub async fn send_bytes(
        &self,
        class: TimeoutClass,
        method: Method,
        path: &str,
        body: Bytes,
    ) -> Result<Response> {
        let response = self
            .builder(method, path)
            .timeout(self.budget(class))
            .body(body)
            .send()
            .await
            .map_err(|e| self.classify(e, class))?;
        ensure_success(response).await
    }

    /// Open a streaming POST under the long-operation budget
    ///
    /// The budget covers connecting and receiving the response head. The body
    /// itself is unbounded; consumers bound it by cancelling.
    pub async fn open_stream(&self, path: &str, body: &Value) -> Result<Response> {
        let class = TimeoutClass::LongOperation;
        let budget = self.budget(class);
        let pending = self.builder(Method::POST, path).json(body).send();

        tracing::debug!(budget = class.label(), "Opening stream to {}", path);
        let response = match tokio::time::timeout(budget, pending).await {
            Ok(result) => result.map_err(|e| self.classify(e, class))?,
            Err(_) => {
                return Err(HearthError::Timeout {
                    budget: class.label(),
                    after_ms: budget.as_millis() as u64,
                });
            }
        };
        ensure_success(response).await
    }

    /// Map a reqwest failure onto the error taxonomy
    pub fn classify(&self, error: reqwest::Error, class: TimeoutClass) -> HearthError {
        if error.is_timeout() {
            HearthError::Timeout {
                budget: class.label(),
                after_ms: self.budget(class).as_millis() as u64,
            }
        } else if error.is_connect() {
            HearthError::ConnectionRefused {
                url: self.base_url.clone(),
            }
        } else {
            HearthError::Network(error.to_string())
        }
    }
}

async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(HearthError::Http {
        status: status.as_u16(),
        body: extract_error_message(&body),
    })
}

/// Prefer the backend's `{"error": "..."}` message over the raw body
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport(uri: &str, standard_ms: u64, long_ms: u64) -> DualTimeoutTransport {
        DualTimeoutTransport::with_timeouts(
            uri,
            Duration::from_millis(standard_ms),
            Duration::from_millis(long_ms),
        )
        .unwrap()
    }

    /// A local port with nothing listening on it
    fn closed_port_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{port}")
    }

    #[test]
    fn test_rejects_non_http_base_url() {
        let result = DualTimeoutTransport::with_timeouts(
            "ftp://example.com",
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(HearthError::Config(_))));
    }

    #[test]
    fn test_budget_selection() {
        let t = transport("http://localhost:11434/", 100, 9000);
        assert_eq!(t.budget(TimeoutClass::Standard), Duration::from_millis(100));
        assert_eq!(
            t.budget(TimeoutClass::LongOperation),
            Duration::from_millis(9000)
        );
        assert_eq!(t.base_url(), "http://localhost:11434");
    }

    #[tokio::test]
    async fn test_standard_budget_times_out() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"models": []}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&mock_server)
            .await;

        let t = transport(&mock_server.uri(), 50, 5000);
        let err = t
            .send(TimeoutClass::Standard, Method::GET, "/api/tags", None)
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "expected timeout, got {err}");
    }

    #[tokio::test]
    async fn test_long_budget_outlasts_slow_response() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"models": []}))
                    .set_delay(Duration::from_millis(150)),
            )
            .mount(&mock_server)
            .await;

        let t = transport(&mock_server.uri(), 50, 5000);
        let response = t
            .send(TimeoutClass::LongOperation, Method::GET, "/api/tags", None)
            .await;
        assert!(response.is_ok());
    }

    #[tokio::test]
    async fn test_connection_refused_is_distinct() {
        let t = transport(&closed_port_url(), 1000, 1000);
        let err = t
            .send(TimeoutClass::Standard, Method::GET, "/", None)
            .await
            .unwrap_err();
        assert!(err.is_connection_refused(), "got {err}");
        assert!(err.to_string().contains("ollama serve"));
    }

    #[tokio::test]
    async fn test_http_status_error_carries_backend_message() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/show"))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_json(serde_json::json!({"error": "model 'nope' not found"})),
            )
            .mount(&mock_server)
            .await;

        let t = transport(&mock_server.uri(), 1000, 1000);
        let err = t
            .send(
                TimeoutClass::Standard,
                Method::POST,
                "/api/show",
                Some(&serde_json::json!({"model": "nope"})),
            )
            .await
            .unwrap_err();

        match err {
            HearthError::Http { status, body } => {
                assert_eq!(status, 404);
                assert_eq!(body, "model 'nope' not found");
            }
            other => panic!("expected Http error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_open_stream_times_out_waiting_for_head() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&mock_server)
            .await;

        let t = transport(&mock_server.uri(), 5000, 50);
        let err = t
            .open_stream("/api/generate", &serde_json::json!({"stream": true}))
            .await
            .unwrap_err();
        match err {
            HearthError::Timeout { budget, after_ms } => {
                assert_eq!(budget, "long-operation");
                assert_eq!(after_ms, 50);
            }
            other => panic!("expected timeout, got {other}"),
        }
    }

    #[test]
    fn test_extract_error_message_falls_back_to_body() {
        assert_eq!(extract_error_message("plain failure"), "plain failure");
        assert_eq!(extract_error_message(r#"{"error":"boom"}"#), "boom");
    }
}
