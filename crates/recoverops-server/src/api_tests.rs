use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use recoverops_core::{
    channel::{ChannelOutcome, Channels, RemediationChannel},
    config::Config,
    db::Db,
    pipeline::Registry,
    reasoner::HeuristicReasoner,
    types::{
        FailureType, FixSpec, FixType, GeneratedFix, Incident, IncidentStatus, NewIncident,
        RemediationStatus, RollbackData, Severity,
    },
};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tower::ServiceExt;

use crate::{router, AppState};

// ── helpers ──────────────────────────────────────────────────────────────────

struct NoopChannel;

#[async_trait]
impl RemediationChannel for NoopChannel {
    fn name(&self) -> &str {
        "noop"
    }

    async fn apply(&self, _incident: &Incident, _fix: &FixSpec) -> Result<ChannelOutcome> {
        Ok(ChannelOutcome {
            message: "applied".into(),
            details: json!({}),
            rollback: RollbackData::None,
        })
    }

    async fn rollback(&self, _data: &RollbackData) -> Result<()> {
        Ok(())
    }

    async fn verify(&self, _data: &RollbackData) -> Result<bool> {
        Ok(true)
    }
}

fn app() -> (Router, Arc<AppState>) {
    let mut db = Db::open(":memory:").expect("open in-memory db");
    db.migrate().expect("migrate");
    let db = Arc::new(db);
    let config = Config {
        github_webhook_secret: "hook-secret".into(),
        ..Config::default()
    };
    let channels = Channels::new(Arc::new(NoopChannel), Arc::new(NoopChannel));
    let (registry, _rx) = Registry::with_channels(
        &config,
        Arc::clone(&db),
        Arc::new(HeuristicReasoner),
        channels,
        Arc::new(AtomicBool::new(true)),
    )
    .expect("registry");
    let (log_tx, _) = broadcast::channel(16);
    let state = Arc::new(AppState {
        db,
        registry: Arc::new(registry),
        start_time: Instant::now(),
        log_tx,
        log_ring: Arc::new(Mutex::new(VecDeque::new())),
    });
    (router(Arc::clone(&state)), state)
}

fn insert_incident(db: &Db) -> i64 {
    db.insert_incident(&NewIncident {
        title: "Build Failure in 555".into(),
        severity: Severity::High,
        source_type: "github".into(),
        source_id: "555".into(),
        repository: "acme/app".into(),
        branch: "main".into(),
        failure_type: FailureType::BuildFailure,
        error_message: "error: compilation failed".into(),
        confidence_score: 0.8,
        ..Default::default()
    })
    .expect("insert incident")
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            req = req.header("content-type", "application/json");
            Body::from(v.to_string())
        },
        None => Body::empty(),
    };
    let resp = app
        .clone()
        .oneshot(req.body(body).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

// ── webhooks ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn github_webhook_requires_valid_signature() {
    let (app, state) = app();
    let req = Request::post("/webhooks/github")
        .header("x-github-event", "workflow_run")
        .header("x-hub-signature-256", "sha256=00")
        .body(Body::from(r#"{"workflow_run": {"id": 1}}"#))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(state.db.count_pipeline_runs().unwrap(), 0);

    let req = Request::post("/webhooks/github")
        .body(Body::from("{}"))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn jenkins_malformed_body_is_400() {
    let (app, _state) = app();
    let req = Request::post("/webhooks/jenkins")
        .body(Body::from("not json"))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn generic_and_health_endpoints() {
    let (app, _state) = app();
    let (status, body) = send(&app, "POST", "/webhooks/generic", Some(json!({ "a": 1 }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["event"], "generic");

    let (status, body) = send(&app, "GET", "/webhooks/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["platforms"][0], "github");
}

// ── incidents ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn list_and_get_incidents() {
    let (app, state) = app();
    let id = insert_incident(&state.db);

    let (status, body) = send(&app, "GET", "/api/incidents?status=detected&limit=10", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, body) = send(&app, "GET", &format!("/api/incidents/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["title"], "Build Failure in 555");

    let (status, _) = send(&app, "GET", "/api/incidents/999", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn status_update_must_follow_lifecycle() {
    let (app, state) = app();
    let id = insert_incident(&state.db);
    let uri = format!("/api/incidents/{id}");

    for to in ["analyzing", "fixing", "resolved", "failed"] {
        let (status, body) = send(&app, "PUT", &uri, Some(json!({ "status": to }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "status {to}");
        assert!(body["detail"].as_str().unwrap().contains("rolled_back"));
    }
    assert_eq!(
        state.db.get_incident(id).unwrap().unwrap().status,
        IncidentStatus::Detected
    );

    let (status, body) = send(
        &app,
        "PUT",
        &uri,
        Some(json!({ "status": "detected", "severity": "critical" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "detected");
    assert_eq!(body["severity"], "critical");

    let (status, _) = send(&app, "PUT", &uri, Some(json!({ "status": "rolled_back" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn status_rolled_back_runs_channel_rollback() {
    let (app, state) = app();
    let id = insert_incident(&state.db);
    let rid = state
        .db
        .insert_remediation(
            id,
            &GeneratedFix {
                fix_type: FixType::DependencyUpdate,
                description: "Add missing Python package: requests".into(),
                content: "requests\n".into(),
                target_files: vec!["requirements.txt".into()],
                confidence: 0.85,
                validation_steps: vec![],
                retryable: false,
            },
        )
        .unwrap();
    for to in [
        IncidentStatus::Analyzing,
        IncidentStatus::Fixing,
        IncidentStatus::Resolved,
    ] {
        assert!(state.db.transition_incident(id, to).unwrap());
    }
    let data = RollbackData::GitPr {
        repository: "acme/app".into(),
        pr_number: 7,
        branch: format!("ai-fix-{id}"),
    };
    state
        .db
        .mark_remediation_success(rid, &data, &json!({}))
        .unwrap();

    let (status, body) = send(
        &app,
        "PUT",
        &format!("/api/incidents/{id}"),
        Some(json!({ "status": "rolled_back" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "rolled_back");
    assert_eq!(
        state.db.get_remediation(rid).unwrap().unwrap().status,
        RemediationStatus::RolledBack
    );
}

#[tokio::test]
async fn remediate_and_rollback_map_executor_errors() {
    let (app, state) = app();
    let id = insert_incident(&state.db);

    let (status, _) = send(&app, "POST", "/api/incidents/999/remediate", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app, "POST", &format!("/api/incidents/{id}/remediate"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("detected"));

    let (status, _) = send(&app, "POST", &format!("/api/incidents/{id}/rollback"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    state
        .db
        .transition_incident(id, IncidentStatus::Analyzing)
        .unwrap();
    let (status, body) = send(&app, "POST", &format!("/api/incidents/{id}/remediate"), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["result"]["action"], "regenerating");
}

#[tokio::test]
async fn stats_and_trends() {
    let (app, state) = app();
    insert_incident(&state.db);

    let (status, body) = send(&app, "GET", "/api/incidents/stats/summary", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_incidents"], 1);
    assert_eq!(body["period"], "last_30_days");

    let (status, body) = send(&app, "GET", "/api/incidents/trends/daily?days=500", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["days"], 90);
}

// ── operator controls ────────────────────────────────────────────────────────

#[tokio::test]
async fn emergency_stop_round_trip() {
    let (app, state) = app();

    let (status, body) = send(&app, "POST", "/api/emergency-stop", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["emergency_stop"], true);
    assert!(state.registry.executor.emergency_stopped());

    let (_, body) = send(&app, "GET", "/api/status", None).await;
    assert_eq!(body["emergency_stop"], true);
    assert_eq!(body["reasoner"], "heuristic");
    assert_eq!(body["queues"]["remediation"], 0);

    let (status, _) = send(&app, "DELETE", "/api/emergency-stop", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!state.registry.executor.emergency_stopped());
}

#[tokio::test]
async fn auto_remediation_toggle_applies_immediately() {
    let (app, state) = app();

    let (status, body) = send(
        &app,
        "PUT",
        "/api/settings",
        Some(json!({ "auto_remediation_enabled": false, "unknown_key": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["updated"], 1);
    assert!(!state.registry.executor.auto_enabled());

    let (_, body) = send(&app, "GET", "/api/settings", None).await;
    assert_eq!(body["auto_remediation_enabled"], false);

    let (status, _) = send(
        &app,
        "PUT",
        "/api/settings",
        Some(json!({ "max_concurrent_remediations": "lots" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
