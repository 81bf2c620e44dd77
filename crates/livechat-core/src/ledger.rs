// In-memory message ledger. Messages are soft-deleted, never removed, so a
// deletion can always report what was deleted.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::text::{is_blank, truncate_to_max_words, MAX_MESSAGE_WORDS};

/// Display name used when a sender leaves the name empty.
pub const ANONYMOUS_USER: &str = "Anonymous";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: u64,
    pub user: String,
    pub text: String,
    #[serde(rename = "ip")]
    pub sender_identity: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Ordered store of every message submitted during this process run.
#[derive(Debug)]
pub struct MessageLedger {
    messages: Vec<Message>,
    next_id: u64,
}

impl Default for MessageLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageLedger {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            next_id: 1,
        }
    }

    /// Store a submission. Returns `None` (consuming no id) when the text is
    /// empty after whitespace normalization.
    pub fn append(&mut self, user: &str, raw_text: &str, sender_identity: Option<String>) -> Option<Message> {
        if is_blank(raw_text) {
            return None;
        }
        let text = truncate_to_max_words(raw_text, MAX_MESSAGE_WORDS);
        let user = match user.trim() {
            "" => ANONYMOUS_USER.to_string(),
            name => name.to_string(),
        };

        let message = Message {
            id: self.next_id,
            user,
            text,
            sender_identity,
            created_at: Utc::now(),
            deleted: false,
            deleted_at: None,
        };
        self.next_id += 1;
        self.messages.push(message.clone());
        Some(message)
    }

    /// Mark a message deleted. Returns the message as it was before this call,
    /// or `None` for an unknown id.
    pub fn soft_delete(&mut self, id: u64) -> Option<Message> {
        let message = self.messages.iter_mut().find(|m| m.id == id)?;
        let previous = message.clone();
        if !message.deleted {
            message.deleted = true;
            message.deleted_at = Some(Utc::now());
        }
        Some(previous)
    }

    pub fn get(&self, id: u64) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// The newest `limit` live messages, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<&Message> {
        let mut live: Vec<&Message> = self
            .messages
            .iter()
            .rev()
            .filter(|m| !m.deleted)
            .take(limit)
            .collect();
        live.reverse();
        live
    }

    /// Number of messages ever stored, deleted ones included.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
