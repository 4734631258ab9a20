//! Supabase conversation store
//!
//! Talks to the project's PostgREST interface (`/rest/v1/<table>`) with the
//! anon key. Uses a long-lived reqwest::Client for connection pooling.

use crate::error::ChatError;
use crate::models::{Message, MessageRole, Thread};
use crate::store::ConversationStore;
use crate::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::error;

const CHATS: &str = "chats";
const MESSAGES: &str = "messages";

pub struct SupabaseConversationStore {
    client: Client,
    rest_url: String,
    anon_key: String,
}

#[derive(Debug, Deserialize)]
struct ChatRow {
    id: String,
    title: String,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, Deserialize)]
struct MessageRow {
    id: Value,
    chat_id: String,
    role: String,
    content: String,
    created_at: String,
}

impl SupabaseConversationStore {
    pub fn new(project_url: &str, anon_key: &str) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()
            .map_err(|e| ChatError::store("Failed to build Supabase HTTP client", e))?;

        Ok(Self {
            client,
            rest_url: format!("{}/rest/v1", project_url.trim_end_matches('/')),
            anon_key: anon_key.to_string(),
        })
    }

    fn request(&self, method: reqwest::Method, table: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/{}", self.rest_url, table))
            .header("apikey", &self.anon_key)
            .bearer_auth(&self.anon_key)
    }

    async fn send(&self, context: &str, request: RequestBuilder) -> Result<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| ChatError::store(context, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("Supabase {} failed with {}: {}", context, status, body);
            return Err(ChatError::StoreUnavailable(format!(
                "{}: Supabase returned {}: {}",
                context, status, body
            )));
        }

        Ok(response)
    }
}

/// PostgREST renders `timestamptz` with an offset and `timestamp` without
/// one; the latter is taken as UTC.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| ChatError::store(&format!("Unparseable timestamp '{}'", raw), e))
}

impl TryFrom<ChatRow> for Thread {
    type Error = ChatError;

    fn try_from(row: ChatRow) -> Result<Self> {
        Ok(Thread {
            id: row.id,
            title: row.title,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
        })
    }
}

impl TryFrom<MessageRow> for Message {
    type Error = ChatError;

    fn try_from(row: MessageRow) -> Result<Self> {
        let id = match row.id {
            Value::String(s) => s,
            other => other.to_string(),
        };
        Ok(Message {
            id,
            chat_id: row.chat_id,
            role: row
                .role
                .parse::<MessageRole>()
                .map_err(|e| ChatError::store("Malformed messages row", e))?,
            content: row.content,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

#[async_trait::async_trait]
impl ConversationStore for SupabaseConversationStore {
    async fn ensure_thread(&self, thread_id: &str, title_seed: &str) -> Result<bool> {
        let thread = Thread::new(thread_id, title_seed);
        let request = self
            .request(reqwest::Method::POST, CHATS)
            .query(&[("on_conflict", "id")])
            .header("Prefer", "resolution=ignore-duplicates,return=representation")
            .json(&json!({
                "id": thread.id,
                "title": thread.title,
                "created_at": thread.created_at.to_rfc3339(),
                "updated_at": thread.updated_at.to_rfc3339(),
            }));

        // An ignored duplicate comes back as an empty array.
        let inserted: Vec<Value> = self
            .send("create chat", request)
            .await?
            .json()
            .await
            .map_err(|e| ChatError::store("Invalid create chat response", e))?;

        Ok(!inserted.is_empty())
    }

    async fn append_message(&self, thread_id: &str, role: MessageRole, content: &str) -> Result<()> {
        let request = self
            .request(reqwest::Method::POST, MESSAGES)
            .header("Prefer", "return=minimal")
            .json(&json!({
                "chat_id": thread_id,
                "role": role.as_str(),
                "content": content,
                "created_at": Utc::now().to_rfc3339(),
            }));

        self.send("insert message", request).await?;
        Ok(())
    }

    async fn touch_thread(&self, thread_id: &str) -> Result<()> {
        let request = self
            .request(reqwest::Method::PATCH, CHATS)
            .query(&[("id", format!("eq.{}", thread_id))])
            .header("Prefer", "return=representation")
            .json(&json!({ "updated_at": Utc::now().to_rfc3339() }));

        let updated: Vec<Value> = self
            .send("update chat", request)
            .await?
            .json()
            .await
            .map_err(|e| ChatError::store("Invalid update chat response", e))?;

        if updated.is_empty() {
            return Err(ChatError::NotFound(format!("thread {}", thread_id)));
        }
        Ok(())
    }

    async fn list_threads(&self) -> Result<Vec<Thread>> {
        let request = self
            .request(reqwest::Method::GET, CHATS)
            .query(&[("select", "*"), ("order", "updated_at.desc")]);

        let rows: Vec<ChatRow> = self
            .send("list chats", request)
            .await?
            .json()
            .await
            .map_err(|e| ChatError::store("Invalid list chats response", e))?;

        rows.into_iter().map(Thread::try_from).collect()
    }

    async fn list_messages(&self, thread_id: &str) -> Result<Vec<Message>> {
        let request = self.request(reqwest::Method::GET, MESSAGES).query(&[
            ("select", "*".to_string()),
            ("chat_id", format!("eq.{}", thread_id)),
            ("order", "created_at.asc,id.asc".to_string()),
        ]);

        let rows: Vec<MessageRow> = self
            .send("list messages", request)
            .await?
            .json()
            .await
            .map_err(|e| ChatError::store("Invalid list messages response", e))?;

        rows.into_iter().map(Message::try_from).collect()
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let request = self
            .request(reqwest::Method::DELETE, CHATS)
            .query(&[("id", format!("eq.{}", thread_id))]);

        self.send("delete chat", request).await?;
        Ok(())
    }
}
