use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
};
use chrono::Utc;
use recoverops_core::{
    config::Config,
    db::IncidentUpdate,
    executor::ExecutorError,
    types::{IncidentFilter, IncidentStatus, Severity},
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::info;

use crate::AppState;

// ── Error helpers ─────────────────────────────────────────────────────────

pub(crate) fn internal(e: impl std::fmt::Display) -> StatusCode {
    tracing::error!("internal error: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

type ActionResult = Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)>;

fn api_error(status: StatusCode, detail: impl Into<String>) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "detail": detail.into() })))
}

fn api_internal(e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    api_error(internal(e), "internal error")
}

fn executor_error(e: ExecutorError) -> (StatusCode, Json<Value>) {
    let status = match &e {
        ExecutorError::NotFound(_) => StatusCode::NOT_FOUND,
        ExecutorError::Conflict(_) => StatusCode::CONFLICT,
        ExecutorError::InvalidState(_) => StatusCode::BAD_REQUEST,
        ExecutorError::Internal(_) => return api_internal(&e),
    };
    api_error(status, e.to_string())
}

// ── Request body types ────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct UpdateIncidentBody {
    pub title: Option<String>,
    pub description: Option<String>,
    pub severity: Option<Severity>,
    pub root_cause: Option<String>,
    pub status: Option<IncidentStatus>,
}

#[derive(Deserialize)]
pub(crate) struct TrendsQuery {
    pub days: Option<i64>,
}

// ── Incidents ─────────────────────────────────────────────────────────────

pub(crate) async fn list_incidents(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<IncidentFilter>,
) -> Result<Json<Value>, StatusCode> {
    let incidents = state.db.list_incidents(&filter).map_err(internal)?;
    Ok(Json(json!(incidents)))
}

pub(crate) async fn get_incident(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, StatusCode> {
    match state.db.get_incident(id).map_err(internal)? {
        None => Err(StatusCode::NOT_FOUND),
        Some(incident) => Ok(Json(json!(incident))),
    }
}

/// Stages own the lifecycle. The only status an operator may set is
/// `rolled_back`, which runs the full channel rollback.
pub(crate) async fn update_incident(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateIncidentBody>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let current = state
        .db
        .get_incident(id)
        .map_err(api_internal)?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("incident {id} not found")))?;

    match body.status.filter(|s| *s != current.status) {
        None => {},
        Some(IncidentStatus::RolledBack) => {
            let report = state
                .registry
                .executor
                .rollback(id)
                .await
                .map_err(executor_error)?;
            info!(
                incident_id = id,
                rolled_back = report.rolled_back.len(),
                "rollback requested through incident update"
            );
        },
        Some(to) => {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                format!(
                    "status {} is set by the pipeline, only rolled_back can be requested",
                    to.as_str()
                ),
            ));
        },
    }

    state
        .db
        .update_incident(
            id,
            &IncidentUpdate {
                title: body.title,
                description: body.description,
                severity: body.severity,
                root_cause: body.root_cause,
            },
        )
        .map_err(api_internal)?;

    let incident = state
        .db
        .get_incident(id)
        .map_err(api_internal)?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("incident {id} not found")))?;
    Ok(Json(json!(incident)))
}

pub(crate) async fn list_remediations(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, StatusCode> {
    if state.db.get_incident(id).map_err(internal)?.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    let remediations = state.db.list_remediations(id).map_err(internal)?;
    Ok(Json(json!(remediations)))
}

pub(crate) async fn remediate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ActionResult {
    let result = state
        .registry
        .executor
        .trigger_manual(id)
        .map_err(executor_error)?;
    info!(incident_id = id, "manual remediation requested");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "incident_id": id, "result": result })),
    ))
}

pub(crate) async fn rollback(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ActionResult {
    let report = state
        .registry
        .executor
        .rollback(id)
        .await
        .map_err(executor_error)?;
    Ok((StatusCode::OK, Json(json!(report))))
}

pub(crate) async fn stats_summary(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, StatusCode> {
    let stats = state.db.incident_stats().map_err(internal)?;
    Ok(Json(json!(stats)))
}

pub(crate) async fn daily_trends(
    State(state): State<Arc<AppState>>,
    Query(q): Query<TrendsQuery>,
) -> Result<Json<Value>, StatusCode> {
    let days = q.days.unwrap_or(7).clamp(1, 90);
    let trends = state.db.daily_trends(days).map_err(internal)?;
    Ok(Json(json!({ "days": days, "trends": trends })))
}

// ── Emergency stop ────────────────────────────────────────────────────────

pub(crate) async fn emergency_stop(State(state): State<Arc<AppState>>) -> Json<Value> {
    let executor = &state.registry.executor;
    executor.set_emergency_stop(true);
    Json(json!({
        "emergency_stop": true,
        "cancelled_in_flight": executor.in_flight().len(),
    }))
}

pub(crate) async fn clear_emergency_stop(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.registry.executor.set_emergency_stop(false);
    Json(json!({ "emergency_stop": false }))
}

// ── Status and health ─────────────────────────────────────────────────────

pub(crate) async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let database = match state.db.get_config("auto_remediation_enabled") {
        Ok(_) => "ok",
        Err(e) => {
            tracing::error!("health check query failed: {e:#}");
            "error"
        },
    };
    Json(json!({
        "status": if database == "ok" { "healthy" } else { "degraded" },
        "database": database,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

pub(crate) async fn get_status(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let executor = &state.registry.executor;
    let queues = state.registry.queues.depths().map_err(internal)?;
    Ok(Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_s": state.start_time.elapsed().as_secs(),
        "emergency_stop": executor.emergency_stopped(),
        "auto_remediation_enabled": executor.auto_enabled(),
        "max_concurrent_remediations": executor.max_concurrent(),
        "in_flight": executor.in_flight(),
        "queues": queues,
        "reasoner": state.registry.reasoner.name(),
    })))
}

// ── Settings ──────────────────────────────────────────────────────────────

const BOOL_SETTINGS: &[&str] = &["auto_remediation_enabled"];
const NUMERIC_SETTINGS: &[&str] = &[
    "max_concurrent_remediations",
    "ai_confidence_threshold",
    "remediation_timeout",
    "rollback_timeout",
    "dedup_window_secs",
    "auto_merge_confidence",
    "llm_timeout",
];

pub(crate) async fn get_settings(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let mut obj = serde_json::Map::new();
    for key in Config::SETTINGS_KEYS {
        let s = state.db.get_config(key).map_err(internal)?.unwrap_or_default();
        let json_val = if BOOL_SETTINGS.contains(key) {
            json!(s == "true" || s == "1")
        } else if NUMERIC_SETTINGS.contains(key) {
            s.parse::<f64>().map(|n| json!(n)).unwrap_or(json!(s))
        } else {
            json!(s)
        };
        obj.insert(key.to_string(), json_val);
    }
    Ok(Json(Value::Object(obj)))
}

/// `auto_remediation_enabled` applies immediately; other keys on next start.
pub(crate) async fn put_settings(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let map = body.as_object().ok_or(StatusCode::BAD_REQUEST)?;
    let mut updated = 0usize;
    for (key, val) in map {
        if !Config::SETTINGS_KEYS.contains(&key.as_str()) {
            continue;
        }
        let s = match val {
            Value::String(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            _ => continue,
        };
        if NUMERIC_SETTINGS.contains(&key.as_str()) && s.parse::<f64>().is_err() {
            return Err(StatusCode::BAD_REQUEST);
        }
        if key == "auto_remediation_enabled" {
            state
                .registry
                .executor
                .set_auto_enabled(s == "true" || s == "1");
        }
        state.db.set_config(key, &s).map_err(internal)?;
        updated += 1;
    }
    Ok(Json(json!({ "updated": updated })))
}

// ── SSE logs ──────────────────────────────────────────────────────────────

pub(crate) async fn sse_logs(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let rx = state.log_tx.subscribe();
    let backlog: Vec<String> = state
        .log_ring
        .lock()
        .map(|ring| ring.iter().cloned().collect())
        .unwrap_or_default();
    let history = tokio_stream::iter(backlog).map(|data| Ok(Event::default().data(data)));
    let live = BroadcastStream::new(rx).filter_map(|msg| {
        msg.ok().map(|data| Ok(Event::default().data(data)))
    });
    Sse::new(history.chain(live)).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("ping"),
    )
}
