//! Chat transports
//!
//! The relay does not speak any chat protocol itself. It hands finished
//! messages to a [`ChatTransport`] and watches whether a conversation has any
//! messages yet.

mod memory;
mod webhook;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::watch;

pub use memory::InMemoryTransport;
pub use webhook::WebhookTransport;

/// Extra-data key marking a message as produced by the model
pub const GENERATED_MARKER: &str = "gemini";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Transport rejected message {message_id}: {reason}")]
    Rejected { message_id: String, reason: String },
}

/// A message handed to the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub id: String,
    pub conversation_id: String,
    pub text: String,
    /// Free-form metadata carried alongside the body
    #[serde(default)]
    pub extra: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl OutboundMessage {
    /// A model reply with a fresh id and the generated marker set
    pub fn generated(conversation_id: impl Into<String>, text: impl Into<String>) -> Self {
        let mut extra = Map::new();
        extra.insert(GENERATED_MARKER.to_string(), Value::Bool(true));
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            text: text.into(),
            extra,
            created_at: Utc::now(),
        }
    }

    /// A message written by a person
    pub fn user(
        conversation_id: impl Into<String>,
        id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            conversation_id: conversation_id.into(),
            text: text.into(),
            extra: Map::new(),
            created_at: Utc::now(),
        }
    }

    pub fn is_generated(&self) -> bool {
        self.extra
            .get(GENERATED_MARKER)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Transport acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub message_id: String,
    /// False when the transport already had a message with this id
    pub created: bool,
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_message(&self, message: &OutboundMessage) -> Result<Ack, TransportError>;

    /// Live "conversation has at least one message" flag
    fn watch_has_messages(&self, conversation_id: &str) -> watch::Receiver<bool>;
}
