//! Records kept in the vault

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A file attached to a chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    /// Base64 payload as received from the client
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            attachments: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Read a `{"role","content","images"?}` message from a chat request
    pub fn from_request(value: &Value) -> Option<Self> {
        let role = value.get("role")?.as_str()?;
        let content = value.get("content").and_then(Value::as_str).unwrap_or("");
        let attachments = value
            .get("images")
            .and_then(Value::as_array)
            .map(|images| {
                images
                    .iter()
                    .filter_map(Value::as_str)
                    .enumerate()
                    .map(|(i, data)| Attachment {
                        name: format!("image-{}", i + 1),
                        mime_type: "image/*".to_string(),
                        data: data.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            attachments,
            ..Self::new(role, content)
        })
    }
}

/// Counters reported on the final frame of a generate or chat stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Durations are in nanoseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_eval_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_eval_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_duration: Option<u64>,
}

impl UsageStats {
    /// Extract the counters from a terminal frame; None for non-terminal frames
    pub fn from_frame(frame: &Value) -> Option<Self> {
        if frame.get("done").and_then(Value::as_bool) != Some(true) {
            return None;
        }
        serde_json::from_value(frame.clone()).ok()
    }

    pub fn tokens_per_second(&self) -> Option<f64> {
        match (self.eval_count, self.eval_duration) {
            (Some(count), Some(nanos)) if nanos > 0 => Some(count as f64 * 1e9 / nanos as f64),
            _ => None,
        }
    }
}

/// A persisted conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationLog {
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_usage: Option<UsageStats>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationLog {
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            model: model.into(),
            messages: Vec::new(),
            last_usage: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record one request/reply exchange
    pub fn append_exchange(
        &mut self,
        prompt: Vec<ChatMessage>,
        reply: ChatMessage,
        usage: Option<UsageStats>,
    ) {
        self.messages.extend(prompt);
        self.messages.push(reply);
        if usage.is_some() {
            self.last_usage = usage;
        }
        self.updated_at = Utc::now();
    }
}
