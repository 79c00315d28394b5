//! In-process transport
//!
//! Keeps every conversation's messages in memory. Used when no webhook is
//! configured, and as the transport in tests.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::{Ack, ChatTransport, OutboundMessage, TransportError};

struct ConversationLog {
    messages: Vec<OutboundMessage>,
    has_messages: watch::Sender<bool>,
}

impl ConversationLog {
    fn new() -> Self {
        let (has_messages, _) = watch::channel(false);
        Self {
            messages: Vec::new(),
            has_messages,
        }
    }
}

#[derive(Default)]
pub struct InMemoryTransport {
    conversations: Mutex<HashMap<String, ConversationLog>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages of one conversation in send order
    pub fn messages(&self, conversation_id: &str) -> Vec<OutboundMessage> {
        self.conversations
            .lock()
            .get(conversation_id)
            .map(|log| log.messages.clone())
            .unwrap_or_default()
    }

    /// Messages carrying the generated marker
    pub fn generated_messages(&self, conversation_id: &str) -> Vec<OutboundMessage> {
        self.messages(conversation_id)
            .into_iter()
            .filter(OutboundMessage::is_generated)
            .collect()
    }
}

#[async_trait]
impl ChatTransport for InMemoryTransport {
    async fn send_message(&self, message: &OutboundMessage) -> Result<Ack, TransportError> {
        let mut conversations = self.conversations.lock();
        let log = conversations
            .entry(message.conversation_id.clone())
            .or_insert_with(ConversationLog::new);

        // Redelivery of an id we already hold is acknowledged, not stored twice
        if log.messages.iter().any(|m| m.id == message.id) {
            return Ok(Ack {
                message_id: message.id.clone(),
                created: false,
            });
        }

        log.messages.push(message.clone());
        log.has_messages.send_if_modified(|has| !std::mem::replace(has, true));

        Ok(Ack {
            message_id: message.id.clone(),
            created: true,
        })
    }

    fn watch_has_messages(&self, conversation_id: &str) -> watch::Receiver<bool> {
        self.conversations
            .lock()
            .entry(conversation_id.to_string())
            .or_insert_with(ConversationLog::new)
            .has_messages
            .subscribe()
    }
}
