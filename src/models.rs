//! Core data models for the stock chat assistant

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ChatError;

/// Titles are cut to this many characters before the ellipsis is added.
pub const TITLE_MAX_CHARS: usize = 50;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageRole {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "system" => Ok(MessageRole::System),
            other => Err(ChatError::InvalidRequest(format!("unknown role '{}'", other))),
        }
    }
}

//
// ================= Conversation =================
//

/// A persisted conversation. Serialized as a row of `GET /api/chats`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Thread {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Thread {
    pub fn new(id: impl Into<String>, title_seed: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: derive_title(title_seed),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A single message of a thread. Serialized as a row of
/// `GET /api/chats/{chat_id}/messages`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(chat_id: impl Into<String>, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            chat_id: chat_id.into(),
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Derive a thread title from the first user message: the first
/// [`TITLE_MAX_CHARS`] characters, with `...` appended when cut.
pub fn derive_title(seed: &str) -> String {
    if seed.chars().count() > TITLE_MAX_CHARS {
        let mut title: String = seed.chars().take(TITLE_MAX_CHARS).collect();
        title.push_str("...");
        title
    } else {
        seed.to_string()
    }
}

//
// ================= Turn Request =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    pub content: String,
    pub id: String,
    pub role: MessageRole,
}

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    pub prompt: Prompt,
    pub thread_id: String,
    /// Client-side correlation only, never persisted.
    pub response_id: String,
}

//
// ================= Tool I/O =================
//

/// Arguments the model supplied for one tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInput {
    pub parameters: serde_json::Value,
}

/// Successful tool result; failures travel as `ChatError`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub data: serde_json::Value,
}

impl ToolOutput {
    pub fn ok(data: serde_json::Value) -> Self {
        Self { data }
    }
}
