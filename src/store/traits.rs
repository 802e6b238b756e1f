//! `ChatStore` trait: the storage collaborator the worker talks to.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// A conversation owned by one user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub role: Role,
    pub content: String,
    /// `None` = not rated.
    pub liked: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// A message about to be persisted.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub user_id: String,
    pub role: Role,
    pub content: String,
    pub meta: Option<serde_json::Value>,
}

/// Conversation and message persistence.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Return the caller's conversation `conversation_id`, or create a new one
    /// when it is absent or not owned by `user_id`.
    async fn create_or_get_conversation(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
    ) -> Result<Conversation, DatabaseError>;

    /// Persist a message and touch its conversation.
    async fn save_message(&self, message: NewMessage) -> Result<StoredMessage, DatabaseError>;

    /// Persist an assistant reply.
    async fn save_assistant_message(
        &self,
        conversation_id: &str,
        user_id: &str,
        content: &str,
        meta: Option<serde_json::Value>,
    ) -> Result<StoredMessage, DatabaseError> {
        self.save_message(NewMessage {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            role: Role::Assistant,
            content: content.to_string(),
            meta,
        })
        .await
    }

    /// Messages of a conversation owned by `user_id`, oldest first.
    async fn list_conversation_messages(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<Vec<StoredMessage>, DatabaseError>;

    /// One page of [`ChatStore::list_conversation_messages`].
    async fn page_conversation_messages(
        &self,
        user_id: &str,
        conversation_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredMessage>, DatabaseError>;

    async fn set_conversation_title(
        &self,
        conversation_id: &str,
        title: &str,
    ) -> Result<(), DatabaseError>;

    /// The user's conversations, most recently updated first.
    async fn list_user_conversations(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Conversation>, DatabaseError>;

    /// Record a like/dislike on one of the user's messages.
    async fn set_message_feedback(
        &self,
        user_id: &str,
        message_id: &str,
        liked: bool,
    ) -> Result<StoredMessage, DatabaseError>;
}
