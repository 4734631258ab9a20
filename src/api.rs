//! REST API server for the stock chat assistant
//!
//! Streams chat turns over `POST /api/chat` and exposes the conversation
//! store for the history sidebar.

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::error::ChatError;
use crate::models::{Message, Thread, TurnRequest};
use crate::orchestrator::ChatOrchestrator;
use crate::store::Persistence;

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Handler error, rendered as an `ApiResponse` with a mapped status.
#[derive(Debug)]
pub struct ApiError(pub ChatError);

impl From<ChatError> for ApiError {
    fn from(error: ChatError) -> Self {
        ApiError(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ChatError::StoreUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ChatError::AgentError(_) => StatusCode::BAD_GATEWAY,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        (status, Json(ApiResponse::error(self.0.to_string()))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<ChatOrchestrator>,
    pub persistence: Persistence,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Chat Endpoint
/// =============================

async fn chat_handler(
    State(state): State<ApiState>,
    payload: std::result::Result<Json<TurnRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(request) =
        payload.map_err(|e| ChatError::InvalidRequest(format!("invalid chat request: {}", e)))?;
    info!(
        thread = %request.thread_id,
        response = %request.response_id,
        "Received chat turn"
    );

    let fragments = state.orchestrator.start_turn(request).await?;
    let body = Body::from_stream(fragments.map(|fragment| fragment.map(Bytes::from)));

    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache, no-transform"),
            (header::CONNECTION, "keep-alive"),
        ],
        body,
    )
        .into_response())
}

/// =============================
/// Conversation Endpoints
/// =============================

async fn list_chats(State(state): State<ApiState>) -> ApiResult<Json<Vec<Thread>>> {
    let threads = state.persistence.require()?.list_threads().await?;
    Ok(Json(threads))
}

async fn list_messages(
    State(state): State<ApiState>,
    Path(chat_id): Path<String>,
) -> ApiResult<Json<Vec<Message>>> {
    let messages = state.persistence.require()?.list_messages(&chat_id).await?;
    Ok(Json(messages))
}

async fn delete_chat(
    State(state): State<ApiState>,
    Path(chat_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.orchestrator.delete_thread(&chat_id).await?;
    info!(thread = %chat_id, "Deleted chat");
    Ok(Json(serde_json::json!({ "success": true })))
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<ChatOrchestrator>) -> Router {
    let state = ApiState {
        persistence: orchestrator.persistence().clone(),
        orchestrator,
    };

    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat_handler))
        .route("/api/chats", get(list_chats))
        .route("/api/chats/:chat_id/messages", get(list_messages))
        .route("/api/chats/:chat_id", delete(delete_chat))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    orchestrator: Arc<ChatOrchestrator>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(orchestrator);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
