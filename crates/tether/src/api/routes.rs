//! Route table and HTTP handlers.

use std::collections::HashMap;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use tether_protocol::StreamEvent;

use crate::api::ws::{cursor_from_query, ws_handler};
use crate::api::{ApiError, AppState};
use crate::gateway::{ApprovalInfo, Health};
use crate::store::REPLAY_PAGE_SIZE;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/events", get(list_events))
        .route("/ws/events", get(ws_handler))
        .route("/approvals", get(list_approvals))
        .route("/approvals/{request_id}", post(resolve_approval))
        .route("/rpc/{*method}", post(rpc_passthrough))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(state.gateway.health().await)
}

/// One page of persisted events past a cursor, for non-streaming consumers.
async fn list_events(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<StreamEvent>>, ApiError> {
    let cursor = cursor_from_query(&params);
    let thread = params.get("thread").map(String::as_str);
    let events = state
        .store
        .list_events_since(thread, cursor, REPLAY_PAGE_SIZE)
        .await?;
    Ok(Json(events.iter().map(StreamEvent::from_event).collect()))
}

async fn list_approvals(State(state): State<AppState>) -> Json<Vec<ApprovalInfo>> {
    Json(state.gateway.pending_approvals().await)
}

#[derive(serde::Deserialize)]
struct DecisionBody {
    decision: Value,
}

async fn resolve_approval(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
    Json(body): Json<DecisionBody>,
) -> Result<Json<Value>, ApiError> {
    state
        .gateway
        .respond_approval(&request_id, body.decision)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

/// Thin passthrough to the runtime: POST /rpc/{method} with optional JSON
/// params in the body.
async fn rpc_passthrough(
    State(state): State<AppState>,
    Path(method): Path<String>,
    body: Option<Json<Value>>,
) -> Result<Json<Value>, ApiError> {
    let params = body.map(|Json(v)| v);
    let result = state.gateway.request(&method, params).await?;
    Ok(Json(result))
}
