//! Conversation history and titles as the worker prepares them.

use crate::store::{Role, StoredMessage};
use crate::upstream::HistoryEntry;

/// Characters kept from the first user message when titling a conversation.
pub const TITLE_CHARS: usize = 40;

/// Map stored messages (oldest first) to upstream history, skipping
/// `exclude_id`. Disliked assistant replies carry `dislike = 1`.
pub fn build_history(messages: &[StoredMessage], exclude_id: &str) -> Vec<HistoryEntry> {
    messages
        .iter()
        .filter(|m| m.id != exclude_id)
        .map(|m| match m.role {
            Role::Assistant => HistoryEntry::assistant(&m.content, m.liked == Some(false)),
            Role::User | Role::System => HistoryEntry::user(&m.content),
        })
        .collect()
}

/// First [`TITLE_CHARS`] characters of `content`, with `…` when cut.
pub fn derive_title(content: &str) -> String {
    let trimmed = content.trim();
    let mut chars = trimmed.chars();
    let head: String = chars.by_ref().take(TITLE_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}
