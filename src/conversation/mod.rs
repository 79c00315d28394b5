//! Conversation types and multi-turn state

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Running history of one chat with a model.
///
/// Tied to the model generation it was started for; a reconfigured model
/// starts a new context and the old history is dropped.
#[derive(Debug, Clone, Default)]
pub struct ConversationContext {
    generation: u64,
    messages: Vec<Message>,
}

impl ConversationContext {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            messages: Vec::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Record a completed exchange
    pub fn push_turn(&mut self, user: &str, assistant: &str) {
        self.messages.push(Message {
            role: Role::User,
            content: user.to_string(),
        });
        self.messages.push(Message {
            role: Role::Assistant,
            content: assistant.to_string(),
        });
    }
}
