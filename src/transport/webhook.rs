//! Webhook transport
//!
//! POSTs each outbound message as JSON to a fixed URL, for chat backends that
//! accept server-side message injection over HTTP.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use tokio::sync::watch;

use super::{Ack, ChatTransport, OutboundMessage, TransportError};

pub struct WebhookTransport {
    client: Client,
    url: String,
    has_messages: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl WebhookTransport {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            has_messages: Mutex::new(HashMap::new()),
        }
    }

    fn mark_has_messages(&self, conversation_id: &str) {
        self.has_messages
            .lock()
            .entry(conversation_id.to_string())
            .or_insert_with(|| watch::channel(false).0)
            .send_if_modified(|has| !std::mem::replace(has, true));
    }
}

#[async_trait]
impl ChatTransport for WebhookTransport {
    async fn send_message(&self, message: &OutboundMessage) -> Result<Ack, TransportError> {
        let response = self.client.post(&self.url).json(message).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Rejected {
                message_id: message.id.clone(),
                reason: format!("HTTP {}: {}", status, body),
            });
        }

        tracing::debug!(
            conversation_id = %message.conversation_id,
            message_id = %message.id,
            "Delivered message to webhook"
        );

        self.mark_has_messages(&message.conversation_id);

        Ok(Ack {
            message_id: message.id.clone(),
            created: true,
        })
    }

    fn watch_has_messages(&self, conversation_id: &str) -> watch::Receiver<bool> {
        self.has_messages
            .lock()
            .entry(conversation_id.to_string())
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }
}
