//! Typed operations against the inference backend
//!
//! Non-streaming calls live here. Streaming generate/chat/pull go through
//! [`StreamRelay`](crate::stream::StreamRelay), which shares the same transport.

use bytes::Bytes;
use reqwest::Method;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use super::transport::{DualTimeoutTransport, TimeoutClass};
use super::types::{
    EmbedResponse, ModelInfo, RunningModel, RunningModelsResponse, TagsResponse, VersionResponse,
};
use crate::error::{HearthError, Result};

/// Client for the backend's control and metadata endpoints
#[derive(Debug, Clone)]
pub struct OllamaClient {
    transport: Arc<DualTimeoutTransport>,
}

impl OllamaClient {
    pub fn new(transport: Arc<DualTimeoutTransport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<DualTimeoutTransport> {
        &self.transport
    }

    /// Liveness probe: a 200 on `/` means the backend is up
    pub async fn is_healthy(&self) -> bool {
        match self
            .transport
            .send(TimeoutClass::Standard, Method::GET, "/", None)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("Backend liveness probe failed: {e}");
                false
            }
        }
    }

    pub async fn version(&self) -> Result<String> {
        let response: VersionResponse = self
            .transport
            .send_json(TimeoutClass::Standard, Method::GET, "/api/version", None)
            .await?;
        Ok(response.version)
    }

    /// Installed models
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let response: TagsResponse = self
            .transport
            .send_json(TimeoutClass::Standard, Method::GET, "/api/tags", None)
            .await?;
        Ok(response.models)
    }

    /// Models currently loaded in memory
    pub async fn running_models(&self) -> Result<Vec<RunningModel>> {
        let response: RunningModelsResponse = self
            .transport
            .send_json(TimeoutClass::Standard, Method::GET, "/api/ps", None)
            .await?;
        Ok(response.models)
    }

    pub async fn show_model(&self, name: &str) -> Result<Value> {
        self.transport
            .send_json(
                TimeoutClass::Standard,
                Method::POST,
                "/api/show",
                Some(&json!({ "model": name })),
            )
            .await
    }

    pub async fn delete_model(&self, name: &str) -> Result<()> {
        self.transport
            .send(
                TimeoutClass::Standard,
                Method::DELETE,
                "/api/delete",
                Some(&json!({ "model": name })),
            )
            .await?;
        Ok(())
    }

    pub async fn copy_model(&self, source: &str, destination: &str) -> Result<()> {
        self.transport
            .send(
                TimeoutClass::Standard,
                Method::POST,
                "/api/copy",
                Some(&json!({ "source": source, "destination": destination })),
            )
            .await?;
        Ok(())
    }

    /// Create a model from a Modelfile-style request body
    pub async fn create_model(&self, request: Value) -> Result<Value> {
        self.long_non_streaming("/api/create", request).await
    }

    pub async fn push_model(&self, name: &str) -> Result<Value> {
        self.long_non_streaming("/api/push", json!({ "model": name }))
            .await
    }

    /// One-shot generation (`stream: false`)
    pub async fn generate(&self, request: Value) -> Result<Value> {
        self.long_non_streaming("/api/generate", request).await
    }

    /// One-shot chat completion (`stream: false`)
    pub async fn chat(&self, request: Value) -> Result<Value> {
        self.long_non_streaming("/api/chat", request).await
    }

    async fn long_non_streaming(&self, path: &str, mut request: Value) -> Result<Value> {
        if let Some(obj) = request.as_object_mut() {
            obj.insert("stream".to_string(), Value::Bool(false));
        }
        self.transport
            .send_json(
                TimeoutClass::LongOperation,
                Method::POST,
                path,
                Some(&request),
            )
            .await
    }

    /// Embedding vectors for each input string
    pub async fn embed(&self, model: &str, input: &[String]) -> Result<Vec<Vec<f32>>> {
        let response: EmbedResponse = self
            .transport
            .send_json(
                TimeoutClass::Standard,
                Method::POST,
                "/api/embed",
                Some(&json!({ "model": model, "input": input })),
            )
            .await?;
        Ok(response.embeddings)
    }

    /// Whether the backend already holds a blob
    pub async fn blob_exists(&self, digest: &str) -> Result<bool> {
        validate_digest(digest)?;
        match self
            .transport
            .send(
                TimeoutClass::Standard,
                Method::HEAD,
                &blob_path(digest),
                None,
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(HearthError::Http { status: 404, .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Upload a blob; the content must hash to `digest`
    pub async fn upload_blob(&self, digest: &str, data: Bytes) -> Result<()> {
        validate_digest(digest)?;
        let actual = hex::encode(Sha256::digest(&data));
        if actual != digest {
            return Err(HearthError::DigestMismatch(digest.to_string()));
        }
        self.transport
            .send_bytes(
                TimeoutClass::LongOperation,
                Method::POST,
                &blob_path(digest),
                data,
            )
            .await?;
        Ok(())
    }
}

fn blob_path(digest: &str) -> String {
    format!("/api/blobs/sha256:{digest}")
}

/// A blob digest must be exactly 64 lowercase hex characters
pub fn validate_digest(digest: &str) -> Result<()> {
    let well_formed = digest.len() == 64
        && digest
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if well_formed {
        Ok(())
    } else {
        Err(HearthError::InvalidDigestFormat(digest.to_string()))
    }
}
