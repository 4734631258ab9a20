//! Conversational agent
//!
//! An agent turns one user message into a lazy stream of text fragments.
//! Tool calls happen inside the stream and are invisible to the caller;
//! prior turns are recalled from a checkpoint keyed by thread id.

use crate::Result;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

pub mod checkpoint;
pub mod openai;

pub use checkpoint::{CheckpointStore, InMemoryCheckpointer};
pub use openai::OpenAiAgent;

pub const SYSTEM_PROMPT: &str = "You are a stock analysis assistant. \
You have the ability to get real-time stock prices, \
historical stock prices (given a date range), news and balance sheet data \
for a given ticker symbol.";

/// Response fragments in the order the model produced them.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[async_trait::async_trait]
pub trait ConversationalAgent: Send + Sync {
    /// Start a turn. Nothing happens until the stream is polled; dropping
    /// the stream abandons the turn without touching the checkpoint.
    fn stream(&self, system_prompt: &str, user_message: &str, checkpoint_key: &str) -> FragmentStream;

    /// Drop whatever the agent remembers under `checkpoint_key`.
    async fn forget(&self, _checkpoint_key: &str) {}
}

//
// ================= Transcript =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, as produced by the model.
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionCall,
}

/// One entry of the model-facing transcript (OpenAI chat message shape).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentMessage {
    pub role: AgentRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl AgentMessage {
    fn plain(role: AgentRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(AgentRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(AgentRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(AgentRole::Assistant, content)
    }

    pub fn assistant_tool_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: AgentRole::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: AgentRole::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}
