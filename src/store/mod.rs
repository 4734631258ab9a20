//! Conversation persistence layer
//!
//! Threads and their append-only message logs. Three backends share one
//! trait: in-memory (tests, local runs), direct Postgres, and Supabase
//! over PostgREST.

use crate::config::DatabaseConfig;
use crate::error::ChatError;
use crate::models::{Message, MessageRole, Thread};
use crate::Result;
use std::sync::Arc;
use tracing::{info, warn};

pub mod memory;
pub mod postgres;
pub mod supabase;

pub use memory::InMemoryConversationStore;
pub use postgres::PostgresConversationStore;
pub use supabase::SupabaseConversationStore;

/// Trait for conversation persistence
#[async_trait::async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create the thread if absent. Idempotent; `true` when this call created it.
    async fn ensure_thread(&self, thread_id: &str, title_seed: &str) -> Result<bool>;
    async fn append_message(&self, thread_id: &str, role: MessageRole, content: &str) -> Result<()>;

    /// Ensure the thread (titled from `content`) and append `content` as one
    /// unit. A thread created here is never left behind without its message.
    ///
    /// The default compensates: if the append fails, a thread this call
    /// created is deleted again. Backends with transactions override it.
    async fn open_turn(&self, thread_id: &str, role: MessageRole, content: &str) -> Result<()> {
        let created = self.ensure_thread(thread_id, content).await?;
        if let Err(e) = self.append_message(thread_id, role, content).await {
            if created {
                if let Err(cleanup) = self.delete_thread(thread_id).await {
                    warn!(thread = %thread_id, "Failed to remove empty thread: {}", cleanup);
                }
            }
            return Err(e);
        }
        Ok(())
    }
    /// Refresh `updated_at`. `NotFound` if the thread is gone.
    async fn touch_thread(&self, thread_id: &str) -> Result<()>;
    /// Newest-updated first.
    async fn list_threads(&self) -> Result<Vec<Thread>>;
    /// Oldest-created first.
    async fn list_messages(&self, thread_id: &str) -> Result<Vec<Message>>;
    async fn delete_thread(&self, thread_id: &str) -> Result<()>;
}

/// The store as seen by request handlers: either a configured backend or
/// nothing at all.
#[derive(Clone)]
pub enum Persistence {
    Configured(Arc<dyn ConversationStore>),
    Unconfigured,
}

impl Persistence {
    pub fn configured(store: impl ConversationStore + 'static) -> Self {
        Persistence::Configured(Arc::new(store))
    }

    /// Build the backend named by configuration. Connections are lazy, so an
    /// unreachable database surfaces on first use rather than here.
    pub fn from_config(config: Option<&DatabaseConfig>) -> Result<Self> {
        let Some(config) = config else {
            info!("Conversation store: not configured (stream-only mode)");
            return Ok(Persistence::Unconfigured);
        };

        let persistence = match config {
            DatabaseConfig::Supabase { url, anon_key } => {
                Persistence::configured(SupabaseConversationStore::new(url, anon_key)?)
            }
            DatabaseConfig::Postgres { url } => {
                Persistence::configured(PostgresConversationStore::connect_lazy(url)?)
            }
        };
        info!("Conversation store: {}", config.backend_name());
        Ok(persistence)
    }

    pub fn store(&self) -> Option<&Arc<dyn ConversationStore>> {
        match self {
            Persistence::Configured(store) => Some(store),
            Persistence::Unconfigured => None,
        }
    }

    /// The store, or `StoreUnavailable` for endpoints that cannot degrade.
    pub fn require(&self) -> Result<&Arc<dyn ConversationStore>> {
        self.store()
            .ok_or_else(|| ChatError::StoreUnavailable("Database not configured".to_string()))
    }

    pub fn is_configured(&self) -> bool {
        matches!(self, Persistence::Configured(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconfigured_persistence() {
        let persistence = Persistence::from_config(None).unwrap();
        assert!(!persistence.is_configured());
        assert!(matches!(
            persistence.require(),
            Err(ChatError::StoreUnavailable(_))
        ));
    }

    #[test]
    fn test_configured_persistence_exposes_store() {
        let persistence = Persistence::configured(InMemoryConversationStore::new());
        assert!(persistence.is_configured());
        assert!(persistence.require().is_ok());
    }
}
