use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
};
use recoverops_core::gateway::{GatewayError, WebhookAck};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::AppState;

type WebhookResult = Result<Json<WebhookAck>, (StatusCode, Json<Value>)>;

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn reject(e: GatewayError) -> (StatusCode, Json<Value>) {
    let status = match &e {
        GatewayError::Unauthorized(_) => StatusCode::FORBIDDEN,
        GatewayError::BadPayload(_) => StatusCode::BAD_REQUEST,
        GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("webhook processing failed: {e}");
    } else {
        warn!(status = status.as_u16(), "webhook rejected: {e}");
    }
    (status, Json(json!({ "detail": e.to_string() })))
}

fn missing_header(name: &str) -> (StatusCode, Json<Value>) {
    warn!(header = name, "webhook rejected: missing event header");
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "detail": format!("missing {name} header") })),
    )
}

pub(crate) async fn github(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> WebhookResult {
    let event = header(&headers, "x-github-event").ok_or_else(|| missing_header("X-GitHub-Event"))?;
    let signature = header(&headers, "x-hub-signature-256");
    state
        .registry
        .gateway
        .handle_github(event, signature, &body)
        .map(Json)
        .map_err(reject)
}

pub(crate) async fn gitlab(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> WebhookResult {
    let event = header(&headers, "x-gitlab-event").ok_or_else(|| missing_header("X-Gitlab-Event"))?;
    let token = header(&headers, "x-gitlab-token");
    state
        .registry
        .gateway
        .handle_gitlab(event, token, &body)
        .map(Json)
        .map_err(reject)
}

pub(crate) async fn jenkins(State(state): State<Arc<AppState>>, body: Bytes) -> WebhookResult {
    state
        .registry
        .gateway
        .handle_jenkins(&body)
        .map(Json)
        .map_err(reject)
}

/// Custom integrations are acknowledged and logged; they do not enter the pipeline.
pub(crate) async fn generic(body: Bytes) -> Result<Json<Value>, StatusCode> {
    let payload: Value = serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?;
    let keys: Vec<&str> = payload
        .as_object()
        .map(|m| m.keys().map(String::as_str).collect())
        .unwrap_or_default();
    info!(?keys, "generic webhook received");
    Ok(Json(json!({ "status": "received", "event": "generic" })))
}

pub(crate) async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "platforms": ["github", "gitlab", "jenkins", "generic"],
    }))
}
