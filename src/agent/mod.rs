//! Reply generation
//!
//! The session hands each finished utterance, together with the conversation
//! so far, to a [`Generator`] and records the exchange once it succeeds.

mod chat;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use chat::ChatClient;

use crate::Result;

/// Speaker of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// Text generation collaborator
#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce a reply to `utterance` given the prior exchanges
    ///
    /// # Errors
    ///
    /// Returns `Error::Generation` if no reply could be produced
    async fn generate(&self, utterance: &str, history: &[ChatMessage]) -> Result<String>;
}

/// Per-session history of completed turns
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
}

impl Conversation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed exchange
    pub fn record(&mut self, utterance: impl Into<String>, reply: impl Into<String>) {
        self.messages.push(ChatMessage::user(utterance));
        self.messages.push(ChatMessage::assistant(reply));
    }

    /// Forget every exchange
    pub fn reset(&mut self) {
        self.messages.clear();
    }

    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Number of completed exchanges
    #[must_use]
    pub fn turns(&self) -> usize {
        self.messages.len() / 2
    }
}
