//! HTTP API alongside the WebSocket.
//!
//! Endpoints:
//! - GET /api/messages?partner=&page=&limit= — one page of a conversation
//! - GET /api/conversations — chat-room summary for the caller
//! - GET /api/online — users with a live connection
//!
//! Every `/api` route needs `Authorization: Bearer <token>`.

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::get,
};
use duet_core::message::Message;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::delivery::DeliveryError;
use crate::gateway::ConversationSummary;
use crate::relay::{RelayState, ws_handler};

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/api/messages", get(get_messages))
        .route("/api/conversations", get(get_conversations))
        .route("/api/online", get(get_online))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// Error body: `{"code": "...", "message": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn unauthorized(message: impl Into<String>) -> Self {
        Self { status: StatusCode::UNAUTHORIZED, code: "unauthorized", message: message.into() }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, code: "bad_request", message: message.into() }
    }
}

impl From<DeliveryError> for ApiError {
    fn from(e: DeliveryError) -> Self {
        let status = match e {
            DeliveryError::Validation(_) => StatusCode::BAD_REQUEST,
            DeliveryError::NotFound(_) => StatusCode::NOT_FOUND,
            DeliveryError::Persistence(_) => StatusCode::SERVICE_UNAVAILABLE,
            DeliveryError::Unauthorized(_) => StatusCode::FORBIDDEN,
        };
        Self { status, code: e.code(), message: e.to_string() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "code": self.code, "message": self.message });
        (self.status, Json(body)).into_response()
    }
}

/// Resolve the caller from the bearer token.
fn caller(state: &RelayState, headers: &HeaderMap) -> Result<String, ApiError> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;
    state
        .auth
        .authenticate(token)
        .map_err(|e| ApiError::unauthorized(e.to_string()))
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub partner: Option<String>,
    /// 1-based; page 1 is the newest messages.
    pub page: Option<usize>,
    /// Default 20, capped at 100.
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct MessagesResponse {
    pub messages: Vec<Message>,
    pub page: usize,
    pub limit: usize,
}

/// GET /api/messages — fetching marks the partner's pending messages delivered.
async fn get_messages(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<MessagesResponse>, ApiError> {
    let user = caller(&state, &headers)?;
    let partner = query
        .partner
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::bad_request("partner is required"))?;
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

    let messages = state.delivery.fetch_history(&user, partner, page, limit).await?;
    Ok(Json(MessagesResponse { messages, page, limit }))
}

async fn get_conversations(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ConversationSummary>>, ApiError> {
    let user = caller(&state, &headers)?;
    Ok(Json(state.delivery.conversations(&user).await?))
}

#[derive(Debug, Serialize)]
pub struct OnlineResponse {
    pub users: Vec<String>,
    pub uptime_secs: u64,
}

async fn get_online(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
) -> Result<Json<OnlineResponse>, ApiError> {
    caller(&state, &headers)?;
    let mut users: Vec<String> = state.presence.snapshot_online().await.into_iter().collect();
    users.sort();
    Ok(Json(OnlineResponse { users, uptime_secs: state.start_time.elapsed().as_secs() }))
}
