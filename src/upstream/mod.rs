//! Upstream assist service: request/response types and the client seam.
//!
//! The worker only sees the [`Assist`] trait; [`AssistClient`] is the HTTP
//! implementation with per-attempt timeouts and request fallbacks.

mod client;

pub use client::{AssistClient, RequestVariant};

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::UpstreamError;

/// One prior turn sent as context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
    /// 1 when the user disliked this assistant reply, 0 otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dislike: Option<u8>,
}

impl HistoryEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
            dislike: None,
        }
    }

    pub fn assistant(content: impl Into<String>, disliked: bool) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
            dislike: Some(u8::from(disliked)),
        }
    }
}

/// The current user turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTurn {
    pub role: String,
    pub content: String,
}

impl UserTurn {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Body of `POST {url}{path}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistRequest {
    pub action: i64,
    pub history: Vec<HistoryEntry>,
    pub user: UserTurn,
    pub fdoc: String,
    pub sdoc: String,
    pub query: String,
}

/// Reply from the assist service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistReply {
    #[serde(default, deserialize_with = "lenient_text")]
    pub response: String,
    #[serde(default, deserialize_with = "lenient_docs")]
    pub docs: Vec<Value>,
}

fn lenient_text<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(de)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

fn lenient_docs<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<Value>, D::Error> {
    Ok(match Value::deserialize(de)? {
        Value::Array(docs) => docs,
        _ => Vec::new(),
    })
}

/// The generation service as the worker sees it.
#[async_trait]
pub trait Assist: Send + Sync {
    async fn assist(&self, request: AssistRequest) -> Result<AssistReply, UpstreamError>;
}
