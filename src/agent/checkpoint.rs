//! Agent checkpoints: per-thread transcript memory
//!
//! The checkpoint holds every non-system message of a thread (user,
//! assistant, tool), so follow-up turns only need to send the new message.

use crate::agent::AgentMessage;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Transcript for `key`, empty when the thread is new.
    async fn load(&self, key: &str) -> Vec<AgentMessage>;
    /// Replace the transcript for `key`.
    async fn save(&self, key: &str, transcript: Vec<AgentMessage>);
    async fn forget(&self, key: &str);
}

/// Process-local checkpoints. Lost on restart.
#[derive(Clone, Default)]
pub struct InMemoryCheckpointer {
    transcripts: Arc<RwLock<HashMap<String, Vec<AgentMessage>>>>,
}

impl InMemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CheckpointStore for InMemoryCheckpointer {
    async fn load(&self, key: &str) -> Vec<AgentMessage> {
        self.transcripts
            .read()
            .await
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    async fn save(&self, key: &str, transcript: Vec<AgentMessage>) {
        self.transcripts
            .write()
            .await
            .insert(key.to_string(), transcript);
    }

    async fn forget(&self, key: &str) {
        self.transcripts.write().await.remove(key);
    }
}
