//! In-memory conversation store for development and tests

use crate::error::ChatError;
use crate::models::{Message, MessageRole, Thread};
use crate::store::ConversationStore;
use crate::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    threads: HashMap<String, Thread>,
    /// (insertion sequence, message); the sequence breaks `created_at` ties.
    messages: Vec<(u64, Message)>,
    next_seq: u64,
}

impl Tables {
    fn ensure_thread(&mut self, thread_id: &str, title_seed: &str) -> bool {
        if self.threads.contains_key(thread_id) {
            return false;
        }
        self.threads
            .insert(thread_id.to_string(), Thread::new(thread_id, title_seed));
        true
    }

    fn push_message(&mut self, message: Message) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.messages.push((seq, message));
    }
}

/// In-memory conversation store
#[derive(Clone, Default)]
pub struct InMemoryConversationStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully formed message as-is, keeping its id and timestamp.
    pub async fn import_message(&self, message: Message) {
        self.tables.write().await.push_message(message);
    }

    pub async fn thread(&self, thread_id: &str) -> Option<Thread> {
        self.tables.read().await.threads.get(thread_id).cloned()
    }

    pub async fn thread_count(&self) -> usize {
        self.tables.read().await.threads.len()
    }
}

#[async_trait::async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn ensure_thread(&self, thread_id: &str, title_seed: &str) -> Result<bool> {
        Ok(self.tables.write().await.ensure_thread(thread_id, title_seed))
    }

    async fn append_message(&self, thread_id: &str, role: MessageRole, content: &str) -> Result<()> {
        self.import_message(Message::new(thread_id, role, content)).await;
        Ok(())
    }

    async fn open_turn(&self, thread_id: &str, role: MessageRole, content: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.ensure_thread(thread_id, content);
        tables.push_message(Message::new(thread_id, role, content));
        Ok(())
    }

    async fn touch_thread(&self, thread_id: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        let thread = tables
            .threads
            .get_mut(thread_id)
            .ok_or_else(|| ChatError::NotFound(format!("thread {}", thread_id)))?;
        thread.updated_at = Utc::now();
        Ok(())
    }

    async fn list_threads(&self) -> Result<Vec<Thread>> {
        let tables = self.tables.read().await;
        let mut threads: Vec<Thread> = tables.threads.values().cloned().collect();
        threads.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(threads)
    }

    async fn list_messages(&self, thread_id: &str) -> Result<Vec<Message>> {
        let tables = self.tables.read().await;
        let mut messages: Vec<&(u64, Message)> = tables
            .messages
            .iter()
            .filter(|(_, m)| m.chat_id == thread_id)
            .collect();
        messages.sort_by(|(seq_a, a), (seq_b, b)| {
            a.created_at.cmp(&b.created_at).then(seq_a.cmp(seq_b))
        });
        Ok(messages.into_iter().map(|(_, m)| m.clone()).collect())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.threads.remove(thread_id);
        tables.messages.retain(|(_, m)| m.chat_id != thread_id);
        Ok(())
    }
}
