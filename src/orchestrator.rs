//! Chat turn orchestration
//!
//! A turn runs: ensure the thread and persist the prompt (one atomic store
//! call), stream agent fragments while accumulating them, then persist the assistant message and
//! touch the thread. Store writes are skipped entirely when persistence is
//! unconfigured. Turns on the same thread are serialized.

use crate::agent::{ConversationalAgent, FragmentStream, SYSTEM_PROMPT};
use crate::error::ChatError;
use crate::models::{MessageRole, TurnRequest};
use crate::store::Persistence;
use crate::Result;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

/// Per-thread async locks. Entries nobody holds are pruned on each acquire.
#[derive(Default)]
struct ThreadLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ThreadLocks {
    async fn acquire(&self, thread_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(thread_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Deferred side effect of a turn, run once the fragment stream has ended.
struct TurnCompletion {
    persistence: Persistence,
    thread_id: String,
}

impl TurnCompletion {
    async fn finish(self, accumulated: String) {
        let Some(store) = self.persistence.store() else {
            return;
        };
        if accumulated.is_empty() {
            debug!(thread = %self.thread_id, "Agent produced no text, skipping assistant message");
            return;
        }

        if let Err(e) = store
            .append_message(&self.thread_id, MessageRole::Assistant, &accumulated)
            .await
        {
            warn!(thread = %self.thread_id, "Failed to persist assistant message: {}", e);
            return;
        }

        match store.touch_thread(&self.thread_id).await {
            Ok(()) => {}
            Err(ChatError::NotFound(_)) => {
                warn!(thread = %self.thread_id, "Thread vanished before it could be touched")
            }
            Err(e) => warn!(thread = %self.thread_id, "Failed to touch thread: {}", e),
        }
    }
}

pub struct ChatOrchestrator {
    persistence: Persistence,
    agent: Arc<dyn ConversationalAgent>,
    thread_locks: ThreadLocks,
}

impl ChatOrchestrator {
    pub fn new(persistence: Persistence, agent: Arc<dyn ConversationalAgent>) -> Self {
        Self {
            persistence,
            agent,
            thread_locks: ThreadLocks::default(),
        }
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    /// Run the pre-stream steps of a turn and return the fragment stream.
    ///
    /// Store failures surface here, before anything is streamed. The
    /// returned stream holds the thread lock; the assistant message is only
    /// written if the stream is driven to its end without error.
    pub async fn start_turn(&self, request: TurnRequest) -> Result<FragmentStream> {
        let TurnRequest {
            prompt, thread_id, ..
        } = request;
        if thread_id.trim().is_empty() {
            return Err(ChatError::InvalidRequest("threadId must not be empty".to_string()));
        }
        let content = prompt.content;

        let guard = self.thread_locks.acquire(&thread_id).await;

        if let Some(store) = self.persistence.store() {
            store.open_turn(&thread_id, prompt.role, &content).await?;
        }
        info!(thread = %thread_id, persisted = self.persistence.is_configured(), "Starting turn");

        let mut fragments = self.agent.stream(SYSTEM_PROMPT, &content, &thread_id);
        let completion = TurnCompletion {
            persistence: self.persistence.clone(),
            thread_id,
        };

        Ok(Box::pin(async_stream::stream! {
            let _guard = guard;
            let mut accumulated = String::new();

            while let Some(fragment) = fragments.next().await {
                match fragment {
                    Ok(fragment) => {
                        accumulated.push_str(&fragment);
                        yield Ok(fragment);
                    }
                    Err(e) => {
                        warn!(thread = %completion.thread_id, "Agent failed mid-turn: {}", e);
                        yield Err(e);
                        return;
                    }
                }
            }

            completion.finish(accumulated).await;
        }))
    }

    /// Delete a thread and the agent's memory of it, so a reused id starts
    /// a fresh conversation.
    pub async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        self.persistence.require()?.delete_thread(thread_id).await?;
        self.agent.forget(thread_id).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Message, Prompt, Thread};
    use crate::store::{ConversationStore, InMemoryConversationStore};
    use std::time::Duration;

    #[derive(Clone)]
    enum Step {
        Say(&'static str),
        Fail(&'static str),
    }

    /// Agent that plays back a fixed script and records what it was asked.
    struct ScriptedAgent {
        script: Vec<Step>,
        calls: Mutex<Vec<(String, String)>>,
        forgotten: Mutex<Vec<String>>,
    }

    impl ScriptedAgent {
        fn new(script: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                script,
                calls: Mutex::new(Vec::new()),
                forgotten: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl ConversationalAgent for ScriptedAgent {
        fn stream(&self, _system_prompt: &str, user_message: &str, checkpoint_key: &str) -> FragmentStream {
            self.calls
                .lock()
                .unwrap()
                .push((user_message.to_string(), checkpoint_key.to_string()));
            let script = self.script.clone();
            Box::pin(async_stream::stream! {
                tokio::time::sleep(Duration::from_millis(5)).await;
                for step in script {
                    match step {
                        Step::Say(text) => yield Ok(text.to_string()),
                        Step::Fail(reason) => {
                            yield Err(ChatError::AgentError(reason.to_string()));
                            return;
                        }
                    }
                }
            })
        }

        async fn forget(&self, checkpoint_key: &str) {
            self.forgotten.lock().unwrap().push(checkpoint_key.to_string());
        }
    }

    /// Store whose writes always fail.
    struct BrokenStore;

    #[async_trait::async_trait]
    impl ConversationStore for BrokenStore {
        async fn ensure_thread(&self, _: &str, _: &str) -> Result<bool> {
            Err(ChatError::StoreUnavailable("connection refused".into()))
        }
        async fn append_message(&self, _: &str, _: MessageRole, _: &str) -> Result<()> {
            Err(ChatError::StoreUnavailable("connection refused".into()))
        }
        async fn touch_thread(&self, _: &str) -> Result<()> {
            Err(ChatError::StoreUnavailable("connection refused".into()))
        }
        async fn list_threads(&self) -> Result<Vec<Thread>> {
            Err(ChatError::StoreUnavailable("connection refused".into()))
        }
        async fn list_messages(&self, _: &str) -> Result<Vec<Message>> {
            Err(ChatError::StoreUnavailable("connection refused".into()))
        }
        async fn delete_thread(&self, _: &str) -> Result<()> {
            Err(ChatError::StoreUnavailable("connection refused".into()))
        }
    }

    /// In-memory store whose message inserts fail; thread creation and
    /// deletion still work, so `open_turn` takes the compensating path.
    struct RejectingMessages(InMemoryConversationStore);

    #[async_trait::async_trait]
    impl ConversationStore for RejectingMessages {
        async fn ensure_thread(&self, thread_id: &str, title_seed: &str) -> Result<bool> {
            self.0.ensure_thread(thread_id, title_seed).await
        }
        async fn append_message(&self, _: &str, _: MessageRole, _: &str) -> Result<()> {
            Err(ChatError::StoreUnavailable("insert rejected".into()))
        }
        async fn touch_thread(&self, thread_id: &str) -> Result<()> {
            self.0.touch_thread(thread_id).await
        }
        async fn list_threads(&self) -> Result<Vec<Thread>> {
            self.0.list_threads().await
        }
        async fn list_messages(&self, thread_id: &str) -> Result<Vec<Message>> {
            self.0.list_messages(thread_id).await
        }
        async fn delete_thread(&self, thread_id: &str) -> Result<()> {
            self.0.delete_thread(thread_id).await
        }
    }

    fn turn(thread_id: &str, content: &str) -> TurnRequest {
        TurnRequest {
            prompt: Prompt {
                content: content.to_string(),
                id: "p1".to_string(),
                role: MessageRole::User,
            },
            thread_id: thread_id.to_string(),
            response_id: "r1".to_string(),
        }
    }

    fn orchestrator(agent: Arc<ScriptedAgent>) -> (InMemoryConversationStore, ChatOrchestrator) {
        let store = InMemoryConversationStore::new();
        let orchestrator =
            ChatOrchestrator::new(Persistence::configured(store.clone()), agent);
        (store, orchestrator)
    }

    async fn drain(stream: FragmentStream) -> Vec<Result<String>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn test_turn_persists_user_and_assistant_messages() {
        let agent = ScriptedAgent::new(vec![Step::Say("AAPL is trading "), Step::Say("at $189.50.")]);
        let (store, orchestrator) = orchestrator(agent.clone());

        let stream = orchestrator
            .start_turn(turn("t1", "What is AAPL trading at?"))
            .await
            .unwrap();
        let streamed: String = drain(stream)
            .await
            .into_iter()
            .map(|f| f.unwrap())
            .collect();
        assert_eq!(streamed, "AAPL is trading at $189.50.");

        let thread = store.thread("t1").await.unwrap();
        assert_eq!(thread.title, "What is AAPL trading at?");
        assert!(thread.updated_at > thread.created_at);

        let messages = store.list_messages("t1").await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[0].content, "What is AAPL trading at?");
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert_eq!(messages[1].content, streamed);

        assert_eq!(
            agent.calls(),
            vec![("What is AAPL trading at?".to_string(), "t1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_second_turn_reuses_thread() {
        let agent = ScriptedAgent::new(vec![Step::Say("ok")]);
        let (store, orchestrator) = orchestrator(agent);

        for content in ["first question", "second question"] {
            let stream = orchestrator.start_turn(turn("t1", content)).await.unwrap();
            drain(stream).await;
        }

        assert_eq!(store.thread_count().await, 1);
        assert_eq!(store.thread("t1").await.unwrap().title, "first question");
        let roles: Vec<MessageRole> = store
            .list_messages("t1")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.role)
            .collect();
        assert_eq!(
            roles,
            vec![
                MessageRole::User,
                MessageRole::Assistant,
                MessageRole::User,
                MessageRole::Assistant
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_agent_output_is_not_persisted() {
        let agent = ScriptedAgent::new(vec![]);
        let (store, orchestrator) = orchestrator(agent);

        let stream = orchestrator.start_turn(turn("t1", "hello")).await.unwrap();
        assert!(drain(stream).await.is_empty());

        let messages = store.list_messages("t1").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::User);
    }

    #[tokio::test]
    async fn test_unconfigured_store_streams_only() {
        let agent = ScriptedAgent::new(vec![Step::Say("a"), Step::Say("b"), Step::Say("c")]);
        let orchestrator = ChatOrchestrator::new(Persistence::Unconfigured, agent.clone());

        let stream = orchestrator.start_turn(turn("t1", "hi")).await.unwrap();
        let fragments: Vec<String> = drain(stream).await.into_iter().map(|f| f.unwrap()).collect();
        assert_eq!(fragments, vec!["a", "b", "c"]);
        assert_eq!(agent.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_mid_stream_failure_discards_partial_output() {
        let agent = ScriptedAgent::new(vec![Step::Say("partial "), Step::Fail("upstream reset")]);
        let (store, orchestrator) = orchestrator(agent);

        let stream = orchestrator.start_turn(turn("t1", "hi")).await.unwrap();
        let items = drain(stream).await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_deref().unwrap(), "partial ");
        assert!(matches!(items[1], Err(ChatError::AgentError(_))));

        let messages = store.list_messages("t1").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::User);
    }

    #[tokio::test]
    async fn test_dropped_stream_persists_nothing_and_releases_lock() {
        let agent = ScriptedAgent::new(vec![Step::Say("one"), Step::Say("two")]);
        let (store, orchestrator) = orchestrator(agent);

        let mut stream = orchestrator.start_turn(turn("t1", "hi")).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "one");
        drop(stream);

        assert_eq!(store.list_messages("t1").await.unwrap().len(), 1);

        let next = tokio::time::timeout(
            Duration::from_secs(1),
            orchestrator.start_turn(turn("t1", "again")),
        )
        .await
        .expect("lock should be released once the stream is dropped");
        assert!(next.is_ok());
    }

    #[tokio::test]
    async fn test_same_thread_turns_are_serialized() {
        let agent = ScriptedAgent::new(vec![Step::Say("ok")]);
        let (_store, orchestrator) = orchestrator(agent);

        let first = orchestrator.start_turn(turn("t1", "one")).await.unwrap();

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            orchestrator.start_turn(turn("t1", "two")),
        )
        .await;
        assert!(blocked.is_err());

        let other = tokio::time::timeout(
            Duration::from_millis(50),
            orchestrator.start_turn(turn("t2", "other")),
        )
        .await;
        assert!(other.is_ok());

        drain(first).await;
        let second = orchestrator.start_turn(turn("t1", "two")).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_store_failure_fails_before_streaming() {
        let agent = ScriptedAgent::new(vec![Step::Say("never")]);
        let orchestrator =
            ChatOrchestrator::new(Persistence::configured(BrokenStore), agent.clone());

        let result = orchestrator.start_turn(turn("t1", "hi")).await;
        assert!(matches!(result, Err(ChatError::StoreUnavailable(_))));
        assert!(agent.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_prompt_insert_leaves_no_empty_thread() {
        let agent = ScriptedAgent::new(vec![Step::Say("never")]);
        let inner = InMemoryConversationStore::new();
        let orchestrator = ChatOrchestrator::new(
            Persistence::configured(RejectingMessages(inner.clone())),
            agent.clone(),
        );

        let result = orchestrator.start_turn(turn("t1", "hi")).await;
        assert!(matches!(result, Err(ChatError::StoreUnavailable(_))));
        assert_eq!(inner.thread_count().await, 0);
        assert!(agent.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_prompt_insert_keeps_existing_thread() {
        let agent = ScriptedAgent::new(vec![]);
        let inner = InMemoryConversationStore::new();
        inner.open_turn("t1", MessageRole::User, "first").await.unwrap();
        let orchestrator =
            ChatOrchestrator::new(Persistence::configured(RejectingMessages(inner.clone())), agent);

        let result = orchestrator.start_turn(turn("t1", "second")).await;
        assert!(result.is_err());
        assert_eq!(inner.thread_count().await, 1);
        assert_eq!(inner.list_messages("t1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_prompt_role_is_persisted() {
        let agent = ScriptedAgent::new(vec![]);
        let (store, orchestrator) = orchestrator(agent);

        let mut request = turn("t1", "Answer tersely.");
        request.prompt.role = MessageRole::System;
        drain(orchestrator.start_turn(request).await.unwrap()).await;

        let messages = store.list_messages("t1").await.unwrap();
        assert_eq!(messages[0].role, MessageRole::System);
    }

    #[tokio::test]
    async fn test_delete_thread_forgets_agent_memory() {
        let agent = ScriptedAgent::new(vec![Step::Say("ok")]);
        let (store, orchestrator) = orchestrator(agent.clone());
        drain(orchestrator.start_turn(turn("t1", "hi")).await.unwrap()).await;

        orchestrator.delete_thread("t1").await.unwrap();
        assert_eq!(store.thread_count().await, 0);
        assert_eq!(*agent.forgotten.lock().unwrap(), vec!["t1".to_string()]);

        let unconfigured = ChatOrchestrator::new(Persistence::Unconfigured, agent);
        let err = unconfigured.delete_thread("t1").await.unwrap_err();
        assert!(matches!(err, ChatError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_empty_thread_id_is_rejected() {
        let agent = ScriptedAgent::new(vec![]);
        let (_store, orchestrator) = orchestrator(agent);
        let result = orchestrator.start_turn(turn("  ", "hi")).await;
        assert!(matches!(result, Err(ChatError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_idle_thread_locks_are_pruned() {
        let locks = ThreadLocks::default();
        for id in ["a", "b", "c"] {
            let _guard = locks.acquire(id).await;
        }
        let _held = locks.acquire("d").await;
        assert_eq!(locks.len(), 1);
    }
}
