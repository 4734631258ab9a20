//! OpenAI-compatible streaming agent
//!
//! Speaks `/chat/completions` with `stream: true` and function tools. A turn
//! is a sequence of rounds: text deltas are forwarded as they arrive, tool
//! call deltas are accumulated, and when a round ends on tool calls the tools
//! run and a new round starts with their results appended.
//! Uses a long-lived reqwest::Client for connection pooling.

use crate::agent::{
    AgentMessage, CheckpointStore, ConversationalAgent, FragmentStream, FunctionCall, ToolCall,
};
use crate::config::ModelConfig;
use crate::error::ChatError;
use crate::tools::ToolRegistry;
use crate::Result;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

type EventDataStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Reusable model client (connection-pooled)
#[derive(Clone)]
pub struct OpenAiAgent {
    client: Client,
    config: Arc<ModelConfig>,
    tools: Arc<ToolRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
}

impl OpenAiAgent {
    pub fn new(
        config: ModelConfig,
        tools: ToolRegistry,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ChatError::AgentError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config: Arc::new(config),
            tools: Arc::new(tools),
            checkpoints,
        })
    }

    fn tool_definitions(&self) -> Vec<Value> {
        self.tools
            .tools()
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name(),
                        "description": tool.description(),
                        "parameters": tool.parameters(),
                    }
                })
            })
            .collect()
    }

    /// Send one completion request and return the SSE `data` payloads.
    async fn open_round(&self, api_key: &str, messages: &[AgentMessage]) -> Result<EventDataStream> {
        let url = format!("{}/chat/completions", self.config.base_url);
        let request = CompletionRequest {
            model: &self.config.model,
            messages,
            tools: self.tool_definitions(),
            stream: true,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Model request failed: {}", e);
                ChatError::AgentError(format!("model request failed: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Model endpoint error response {}: {}", status, body);
            return Err(ChatError::AgentError(format!(
                "model endpoint returned {}: {}",
                status, body
            )));
        }

        let events = response.bytes_stream().eventsource().map(|event| {
            event
                .map(|e| e.data)
                .map_err(|e| ChatError::AgentError(format!("model stream interrupted: {}", e)))
        });
        Ok(Box::pin(events))
    }

    /// Run a requested tool; the result (or the failure) becomes the tool
    /// message content the model sees next round.
    async fn run_tool(&self, call: &ToolCall) -> String {
        let raw = call.function.arguments.trim();
        let arguments = if raw.is_empty() {
            Ok(json!({}))
        } else {
            serde_json::from_str::<Value>(raw)
        };

        let outcome = match arguments {
            Ok(arguments) => self.tools.invoke(&call.function.name, arguments).await,
            Err(e) => Err(ChatError::InvalidToolInput(format!(
                "arguments are not valid JSON: {}",
                e
            ))),
        };

        match outcome {
            Ok(output) => serde_json::to_string(&output.data)
                .unwrap_or_else(|e| format!("error: unserializable tool output: {}", e)),
            Err(e) => {
                warn!(tool = %call.function.name, "Tool call failed: {}", e);
                format!("error: {}", e)
            }
        }
    }
}

#[async_trait::async_trait]
impl ConversationalAgent for OpenAiAgent {
    fn stream(&self, system_prompt: &str, user_message: &str, checkpoint_key: &str) -> FragmentStream {
        let agent = self.clone();
        let system_prompt = system_prompt.to_string();
        let user_message = user_message.to_string();
        let key = checkpoint_key.to_string();

        Box::pin(async_stream::stream! {
            let api_key = match agent.config.api_key.clone() {
                Some(key) => key,
                None => {
                    yield Err(ChatError::AgentError(
                        "no model API key configured (set OPENAI_API_KEY)".to_string(),
                    ));
                    return;
                }
            };

            let mut transcript = agent.checkpoints.load(&key).await;
            transcript.push(AgentMessage::user(user_message));

            let mut rounds = 0;
            loop {
                if rounds >= agent.config.max_tool_rounds {
                    yield Err(ChatError::AgentError(format!(
                        "gave up after {} tool rounds",
                        agent.config.max_tool_rounds
                    )));
                    return;
                }
                rounds += 1;

                let mut messages = Vec::with_capacity(transcript.len() + 1);
                messages.push(AgentMessage::system(system_prompt.as_str()));
                messages.extend(transcript.iter().cloned());

                debug!(thread = %key, round = rounds, messages = messages.len(), "Calling model");
                let mut events = match agent.open_round(&api_key, &messages).await {
                    Ok(events) => events,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };

                let mut text = String::new();
                let mut calls = ToolCallAccumulator::default();

                while let Some(data) = events.next().await {
                    let chunk = match data.and_then(|d| parse_event(&d)) {
                        Ok(Some(chunk)) => chunk,
                        Ok(None) => break,
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    };

                    for delta in chunk.choices.into_iter().filter_map(|c| c.delta) {
                        if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                            text.push_str(&content);
                            yield Ok(content);
                        }
                        for call in delta.tool_calls.unwrap_or_default() {
                            calls.apply(call);
                        }
                    }
                }

                let calls = calls.finish();
                if calls.is_empty() {
                    transcript.push(AgentMessage::assistant(text));
                    break;
                }

                info!(
                    thread = %key,
                    tools = ?calls.iter().map(|c| c.function.name.as_str()).collect::<Vec<_>>(),
                    "Model requested tools"
                );
                let content = (!text.is_empty()).then_some(text);
                transcript.push(AgentMessage::assistant_tool_calls(content, calls.clone()));
                for call in &calls {
                    let result = agent.run_tool(call).await;
                    transcript.push(AgentMessage::tool_result(call.id.clone(), result));
                }
            }

            agent.checkpoints.save(&key, transcript).await;
        })
    }

    async fn forget(&self, checkpoint_key: &str) {
        self.checkpoints.forget(checkpoint_key).await;
    }
}

//
// ================= Wire Types =================
//

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [AgentMessage],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    stream: bool,
}

#[derive(Debug, Default, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

/// Decode one SSE `data` payload. `None` marks the end of the round.
fn parse_event(data: &str) -> Result<Option<StreamChunk>> {
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(None);
    }
    if data.is_empty() {
        return Ok(Some(StreamChunk::default()));
    }

    let chunk: StreamChunk = serde_json::from_str(data).map_err(|e| {
        warn!("Failed to parse stream chunk: {} - Data: {}", e, data);
        ChatError::AgentError(format!("malformed stream chunk: {}", e))
    })?;

    if let Some(error) = &chunk.error {
        return Err(ChatError::AgentError(format!("model reported error: {}", error)));
    }
    Ok(Some(chunk))
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Reassembles tool calls that arrive split across deltas, keyed by index.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    calls: BTreeMap<usize, PartialCall>,
}

impl ToolCallAccumulator {
    fn apply(&mut self, delta: ToolCallDelta) {
        let entry = self.calls.entry(delta.index).or_default();
        if let Some(id) = delta.id.filter(|id| !id.is_empty()) {
            entry.id = id;
        }
        if let Some(function) = delta.function {
            if let Some(name) = function.name {
                entry.name.push_str(&name);
            }
            if let Some(arguments) = function.arguments {
                entry.arguments.push_str(&arguments);
            }
        }
    }

    fn finish(self) -> Vec<ToolCall> {
        self.calls
            .into_iter()
            .filter(|(_, call)| !call.name.is_empty())
            .map(|(index, call)| ToolCall {
                id: if call.id.is_empty() {
                    format!("call_{}", index)
                } else {
                    call.id
                },
                kind: "function".to_string(),
                function: FunctionCall {
                    name: call.name,
                    arguments: call.arguments,
                },
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentRole, InMemoryCheckpointer};
    use crate::tools::create_default_registry;
    use crate::tools::market::tests::FakeMarketData;
    use axum::http::header;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::Mutex;

    fn sse(events: &[Value]) -> String {
        let mut body = String::new();
        for event in events {
            body.push_str(&format!("data: {}\n\n", event));
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    fn text_delta(text: &str) -> Value {
        json!({ "choices": [{ "index": 0, "delta": { "content": text }, "finish_reason": null }] })
    }

    /// Fake completion endpoint: asks for the price tool until it sees a
    /// tool result, then answers in two text deltas.
    async fn spawn_model(requests: Arc<Mutex<Vec<Value>>>) -> String {
        let app = Router::new().route(
            "/chat/completions",
            post(move |Json(body): Json<Value>| {
                let requests = requests.clone();
                async move {
                    requests.lock().unwrap().push(body.clone());
                    let messages = body["messages"].as_array().cloned().unwrap_or_default();
                    let last_role = messages
                        .last()
                        .and_then(|m| m["role"].as_str())
                        .unwrap_or_default()
                        .to_string();

                    let events = if last_role == "tool" {
                        vec![text_delta("AAPL is trading at "), text_delta("189.5")]
                    } else {
                        vec![
                            json!({ "choices": [{ "index": 0, "delta": { "role": "assistant", "content": null,
                                "tool_calls": [{ "index": 0, "id": "call_1", "type": "function",
                                    "function": { "name": "get_stock_price", "arguments": "{\"tic" } }] } }] }),
                            json!({ "choices": [{ "index": 0, "delta": {
                                "tool_calls": [{ "index": 0, "function": { "arguments": "ker\":\"aapl\"}" } }] } }] }),
                            json!({ "choices": [{ "index": 0, "delta": {}, "finish_reason": "tool_calls" }] }),
                        ]
                    };

                    ([(header::CONTENT_TYPE, "text/event-stream")], sse(&events)).into_response()
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn agent(base_url: String, checkpoints: Arc<InMemoryCheckpointer>) -> OpenAiAgent {
        let config = ModelConfig {
            base_url,
            model: "test-model".to_string(),
            api_key: Some("sk-test".to_string()),
            max_tool_rounds: 4,
        };
        let registry = create_default_registry(Arc::new(FakeMarketData::default()));
        OpenAiAgent::new(config, registry, checkpoints).unwrap()
    }

    #[test]
    fn test_parse_event_done_and_error() {
        assert!(parse_event("[DONE]").unwrap().is_none());
        assert!(parse_event("{\"type\":\"ping\"}").unwrap().unwrap().choices.is_empty());
        assert!(parse_event("{\"error\":{\"message\":\"overloaded\"}}").is_err());
        assert!(parse_event("not json").is_err());
    }

    #[test]
    fn test_parse_event_tolerates_null_tool_calls() {
        let chunk = parse_event(
            "{\"choices\":[{\"delta\":{\"content\":\"hi\",\"tool_calls\":null},\"finish_reason\":null}]}",
        )
        .unwrap()
        .unwrap();
        let delta = chunk.choices[0].delta.as_ref().unwrap();
        assert_eq!(delta.content.as_deref(), Some("hi"));
        assert!(delta.tool_calls.is_none());
    }

    #[test]
    fn test_accumulator_joins_split_arguments() {
        let mut acc = ToolCallAccumulator::default();
        let deltas: Vec<ToolCallDelta> = serde_json::from_value(json!([
            { "index": 0, "id": "call_a", "function": { "name": "get_stock_price", "arguments": "{\"ticker\":" } },
            { "index": 1, "function": { "name": "get_stock_news", "arguments": "{}" } },
            { "index": 0, "function": { "arguments": "\"MSFT\"}" } }
        ]))
        .unwrap();
        for delta in deltas {
            acc.apply(delta);
        }

        let calls = acc.finish();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[0].function.arguments, "{\"ticker\":\"MSFT\"}");
        assert_eq!(calls[1].id, "call_1");
        assert_eq!(calls[1].function.name, "get_stock_news");
    }

    #[tokio::test]
    async fn test_tool_round_then_text_and_checkpoint() {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let url = spawn_model(requests.clone()).await;
        let checkpoints = Arc::new(InMemoryCheckpointer::new());
        let agent = agent(url, checkpoints.clone());

        let fragments: Vec<String> = agent
            .stream("system", "What is AAPL trading at?", "t1")
            .map(|f| f.unwrap())
            .collect()
            .await;
        assert_eq!(fragments, vec!["AAPL is trading at ", "189.5"]);

        let transcript = checkpoints.load("t1").await;
        let roles: Vec<AgentRole> = transcript.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![AgentRole::User, AgentRole::Assistant, AgentRole::Tool, AgentRole::Assistant]
        );
        let tool_result: Value =
            serde_json::from_str(transcript[2].content.as_deref().unwrap()).unwrap();
        assert_eq!(tool_result["ticker"], "AAPL");
        assert_eq!(transcript[3].content.as_deref(), Some("AAPL is trading at 189.5"));

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0]["stream"], true);
        assert_eq!(requests[0]["messages"][0]["role"], "system");
        assert_eq!(requests[0]["tools"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_second_turn_replays_checkpoint() {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let url = spawn_model(requests.clone()).await;
        let checkpoints = Arc::new(InMemoryCheckpointer::new());
        checkpoints
            .save("t1", vec![AgentMessage::user("hi"), AgentMessage::assistant("hello")])
            .await;
        let agent = agent(url, checkpoints.clone());

        let _: Vec<Result<String>> = agent.stream("system", "and AAPL?", "t1").collect().await;

        let requests = requests.lock().unwrap();
        let first = requests[0]["messages"].as_array().unwrap();
        assert_eq!(first.len(), 4);
        assert_eq!(first[1]["content"], "hi");
        assert_eq!(first[3]["content"], "and AAPL?");
    }

    #[tokio::test]
    async fn test_forget_clears_checkpoint() {
        let checkpoints = Arc::new(InMemoryCheckpointer::new());
        checkpoints
            .save("t1", vec![AgentMessage::user("hi"), AgentMessage::assistant("hello")])
            .await;
        let agent = agent("http://127.0.0.1:9".to_string(), checkpoints.clone());

        agent.forget("t1").await;
        assert!(checkpoints.load("t1").await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_api_key_fails_the_turn() {
        let checkpoints = Arc::new(InMemoryCheckpointer::new());
        let mut agent = agent("http://127.0.0.1:9".to_string(), checkpoints);
        agent.config = Arc::new(ModelConfig {
            api_key: None,
            ..(*agent.config).clone()
        });

        let items: Vec<Result<String>> = agent.stream("system", "hi", "t1").collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(ChatError::AgentError(_))));
    }

    #[tokio::test]
    async fn test_upstream_failure_is_agent_error_and_keeps_checkpoint() {
        let app = Router::new().route(
            "/chat/completions",
            post(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "overloaded") }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let checkpoints = Arc::new(InMemoryCheckpointer::new());
        let agent = agent(format!("http://{}", addr), checkpoints.clone());

        let items: Vec<Result<String>> = agent.stream("system", "hi", "t1").collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(ChatError::AgentError(_))));
        assert!(checkpoints.load("t1").await.is_empty());
    }
}
