//! Postgres conversation store (sqlx)

use crate::error::ChatError;
use crate::models::{Message, MessageRole, Thread};
use crate::store::ConversationStore;
use crate::Result;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::sync::Arc;
use tokio::sync::OnceCell;
use uuid::Uuid;

const INSERT_CHAT_SQL: &str = r#"
    INSERT INTO chats (id, title, created_at, updated_at)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (id) DO NOTHING
"#;

const INSERT_MESSAGE_SQL: &str = r#"
    INSERT INTO messages (id, chat_id, role, content, created_at)
    VALUES ($1, $2, $3, $4, $5)
"#;

/// `seq` orders messages that share a timestamp by insertion.
const LIST_MESSAGES_SQL: &str = r#"
    SELECT id, chat_id, role, content, created_at
    FROM messages
    WHERE chat_id = $1
    ORDER BY created_at ASC, seq ASC
"#;

pub struct PostgresConversationStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PostgresConversationStore {
    /// Create the pool without connecting; the first query connects.
    pub fn connect_lazy(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(url)
            .map_err(|e| ChatError::store("Invalid Postgres connection string", e))?;

        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS chats (
                      id TEXT PRIMARY KEY,
                      title TEXT NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS messages (
                      id UUID PRIMARY KEY,
                      chat_id TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
                      role TEXT NOT NULL,
                      content TEXT NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                      seq BIGSERIAL
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query("ALTER TABLE messages ADD COLUMN IF NOT EXISTS seq BIGSERIAL")
                    .execute(&self.pool)
                    .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_messages_chat_time
                    ON messages (chat_id, created_at, seq);
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| ChatError::store("Failed to initialize conversation schema", e))?;

        Ok(())
    }

    fn thread_from_row(row: &PgRow) -> Result<Thread> {
        Ok(Thread {
            id: row
                .try_get("id")
                .map_err(|e| ChatError::store("Malformed chats row", e))?,
            title: row
                .try_get("title")
                .map_err(|e| ChatError::store("Malformed chats row", e))?,
            created_at: row
                .try_get::<DateTime<Utc>, _>("created_at")
                .map_err(|e| ChatError::store("Malformed chats row", e))?,
            updated_at: row
                .try_get::<DateTime<Utc>, _>("updated_at")
                .map_err(|e| ChatError::store("Malformed chats row", e))?,
        })
    }

    fn message_from_row(row: &PgRow) -> Result<Message> {
        let role: String = row
            .try_get("role")
            .map_err(|e| ChatError::store("Malformed messages row", e))?;
        let id: Uuid = row
            .try_get("id")
            .map_err(|e| ChatError::store("Malformed messages row", e))?;

        Ok(Message {
            id: id.to_string(),
            chat_id: row
                .try_get("chat_id")
                .map_err(|e| ChatError::store("Malformed messages row", e))?,
            role: role
                .parse()
                .map_err(|e| ChatError::store("Malformed messages row", e))?,
            content: row
                .try_get("content")
                .map_err(|e| ChatError::store("Malformed messages row", e))?,
            created_at: row
                .try_get::<DateTime<Utc>, _>("created_at")
                .map_err(|e| ChatError::store("Malformed messages row", e))?,
        })
    }
}

#[async_trait::async_trait]
impl ConversationStore for PostgresConversationStore {
    async fn ensure_thread(&self, thread_id: &str, title_seed: &str) -> Result<bool> {
        self.ensure_schema().await?;
        let thread = Thread::new(thread_id, title_seed);

        let result = sqlx::query(INSERT_CHAT_SQL)
            .bind(&thread.id)
            .bind(&thread.title)
            .bind(thread.created_at)
            .bind(thread.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| ChatError::store("Failed to create chat", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn append_message(&self, thread_id: &str, role: MessageRole, content: &str) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(INSERT_MESSAGE_SQL)
            .bind(Uuid::new_v4())
            .bind(thread_id)
            .bind(role.as_str())
            .bind(content)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| ChatError::store("Failed to insert message", e))?;

        Ok(())
    }

    async fn open_turn(&self, thread_id: &str, role: MessageRole, content: &str) -> Result<()> {
        self.ensure_schema().await?;
        let thread = Thread::new(thread_id, content);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ChatError::store("Failed to begin transaction", e))?;

        sqlx::query(INSERT_CHAT_SQL)
            .bind(&thread.id)
            .bind(&thread.title)
            .bind(thread.created_at)
            .bind(thread.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| ChatError::store("Failed to create chat", e))?;

        sqlx::query(INSERT_MESSAGE_SQL)
            .bind(Uuid::new_v4())
            .bind(thread_id)
            .bind(role.as_str())
            .bind(content)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(|e| ChatError::store("Failed to insert message", e))?;

        tx.commit()
            .await
            .map_err(|e| ChatError::store("Failed to commit turn", e))?;
        Ok(())
    }

    async fn touch_thread(&self, thread_id: &str) -> Result<()> {
        self.ensure_schema().await?;

        let result = sqlx::query("UPDATE chats SET updated_at = $2 WHERE id = $1")
            .bind(thread_id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| ChatError::store("Failed to update chat", e))?;

        if result.rows_affected() == 0 {
            return Err(ChatError::NotFound(format!("thread {}", thread_id)));
        }
        Ok(())
    }

    async fn list_threads(&self) -> Result<Vec<Thread>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            "SELECT id, title, created_at, updated_at FROM chats ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ChatError::store("Failed to list chats", e))?;

        rows.iter().map(Self::thread_from_row).collect()
    }

    async fn list_messages(&self, thread_id: &str) -> Result<Vec<Message>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(LIST_MESSAGES_SQL)
            .bind(thread_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ChatError::store("Failed to list messages", e))?;

        rows.iter().map(Self::message_from_row).collect()
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query("DELETE FROM chats WHERE id = $1")
            .bind(thread_id)
            .execute(&self.pool)
            .await
            .map_err(|e| ChatError::store("Failed to delete chat", e))?;

        Ok(())
    }
}
