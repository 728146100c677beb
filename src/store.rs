//! Conversation persistence seam
//!
//! The bus core never depends on a concrete database. The dispatcher and
//! agents hand messages to a [`ConversationStore`]; the in-memory version is
//! what tests and single-process deployments use.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Who wrote a stored message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderKind {
    User,
    Agent,
    Dispatcher,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: Uuid,
    pub sender: SenderKind,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl StoredMessage {
    pub fn new(sender: SenderKind, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Append to a conversation, creating it on first use. Returns whether
    /// the message was stored.
    async fn append(&self, conversation_id: &str, message: StoredMessage) -> bool;

    /// Messages of a conversation in append order; empty when unknown
    async fn history(&self, conversation_id: &str) -> Vec<StoredMessage>;
}

#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    conversations: RwLock<HashMap<String, Vec<StoredMessage>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn conversation_count(&self) -> usize {
        self.conversations.read().await.len()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn append(&self, conversation_id: &str, message: StoredMessage) -> bool {
        self.conversations
            .write()
            .await
            .entry(conversation_id.to_string())
            .or_default()
            .push(message);
        true
    }

    async fn history(&self, conversation_id: &str) -> Vec<StoredMessage> {
        self.conversations
            .read()
            .await
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }
}
