use std::sync::Arc;

use hmac::{Hmac, Mac};
use recoverops_core::{
    db::Db,
    gateway::{Gateway, GatewayError},
    queue::{QueueName, Queues},
    types::{PipelineStatus, RawSignal},
};
use serde_json::{json, Value};
use sha2::Sha256;

// ── helpers ──────────────────────────────────────────────────────────────────

const SECRET: &str = "hook-secret";

fn setup(github_secret: &str, gitlab_secret: &str) -> (Arc<Db>, Arc<Queues>, Gateway) {
    let mut db = Db::open(":memory:").expect("open in-memory db");
    db.migrate().expect("migrate");
    let db = Arc::new(db);
    let queues = Arc::new(Queues::new(Arc::clone(&db)));
    let gw = Gateway::new(
        Arc::clone(&db),
        Arc::clone(&queues),
        github_secret,
        gitlab_secret,
    );
    (db, queues, gw)
}

fn sign(body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn workflow_run(status: &str, conclusion: Option<&str>) -> Vec<u8> {
    json!({
        "action": "completed",
        "workflow_run": {
            "id": 555,
            "name": "CI",
            "run_number": 42,
            "status": status,
            "conclusion": conclusion,
            "head_branch": "main",
            "head_sha": "abc123",
            "head_commit": { "message": "bump deps", "author": { "name": "dev" } },
            "created_at": "2024-05-01T10:00:00Z",
            "updated_at": "2024-05-01T10:05:00Z",
            "logs_url": "https://api.github.com/logs/555",
        },
        "repository": { "full_name": "acme/app" },
    })
    .to_string()
    .into_bytes()
}

// ── github ───────────────────────────────────────────────────────────────────

#[test]
fn failed_workflow_run_emits_one_raw_signal() {
    let (db, queues, gw) = setup(SECRET, "");
    let body = workflow_run("completed", Some("failure"));
    let sig = sign(&body);

    let ack = gw
        .handle_github("workflow_run", Some(&sig), &body)
        .unwrap();
    assert_eq!(ack.status, "received");
    assert_eq!(ack.event, "workflow_run");

    let run = db.get_pipeline_run("github", "555").unwrap().unwrap();
    assert_eq!(run.status, PipelineStatus::Failed);
    assert_eq!(run.repository, "acme/app");
    assert_eq!(run.branch, "main");
    assert_eq!(run.commit_sha, "abc123");

    let signal: RawSignal = queues.try_pop(QueueName::RawSignal).unwrap().unwrap();
    assert_eq!(signal.source_type, "github");
    assert_eq!(signal.source_id, "555");
    assert_eq!(signal.repository, "acme/app");
    assert_eq!(signal.commit_sha, "abc123");
    assert_eq!(signal.level, "ERROR");
    assert_eq!(signal.message, "Pipeline failed: workflow 'CI' on acme/app@main");
    assert_eq!(signal.metadata["pipeline_run_id"], json!(run.id));

    // The pipeline commit is kept as analysis context.
    let commits = db.recent_commits("acme/app", 10).unwrap();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].message, "bump deps");
}

#[test]
fn redelivery_updates_without_duplicating() {
    let (db, queues, gw) = setup("", "");
    let running = workflow_run("in_progress", None);
    let failed = workflow_run("completed", Some("failure"));

    gw.handle_github("workflow_run", None, &running).unwrap();
    assert_eq!(queues.depth(QueueName::RawSignal).unwrap(), 0);

    gw.handle_github("workflow_run", None, &failed).unwrap();
    gw.handle_github("workflow_run", None, &failed).unwrap();

    assert_eq!(db.count_pipeline_runs().unwrap(), 1);
    assert_eq!(queues.depth(QueueName::RawSignal).unwrap(), 1);
}

#[test]
fn successful_run_emits_nothing() {
    let (db, queues, gw) = setup("", "");
    gw.handle_github("workflow_run", None, &workflow_run("completed", Some("success")))
        .unwrap();
    let run = db.get_pipeline_run("github", "555").unwrap().unwrap();
    assert_eq!(run.status, PipelineStatus::Success);
    assert_eq!(queues.depth(QueueName::RawSignal).unwrap(), 0);
}

#[test]
fn bad_signature_is_rejected_before_any_write() {
    let (db, queues, gw) = setup(SECRET, "");
    let body = workflow_run("completed", Some("failure"));

    let err = gw
        .handle_github("workflow_run", Some("sha256=deadbeef"), &body)
        .unwrap_err();
    assert!(matches!(err, GatewayError::Unauthorized(_)));
    let err = gw.handle_github("workflow_run", None, &body).unwrap_err();
    assert!(matches!(err, GatewayError::Unauthorized(_)));

    assert_eq!(db.count_pipeline_runs().unwrap(), 0);
    assert_eq!(queues.depth(QueueName::RawSignal).unwrap(), 0);
}

#[test]
fn malformed_json_is_bad_payload() {
    let (_db, _queues, gw) = setup("", "");
    let err = gw.handle_github("workflow_run", None, b"{oops").unwrap_err();
    assert!(matches!(err, GatewayError::BadPayload(_)));
}

#[test]
fn failed_check_run_uses_prefixed_id_and_output() {
    let (db, queues, gw) = setup("", "");
    let body = json!({
        "action": "completed",
        "check_run": {
            "id": 77,
            "name": "lint",
            "conclusion": "failure",
            "head_sha": "def456",
            "check_suite": { "head_branch": "feature" },
            "output": { "title": "3 errors", "summary": "unused import" },
        },
        "repository": { "full_name": "acme/app" },
    })
    .to_string();

    gw.handle_github("check_run", None, body.as_bytes()).unwrap();
    assert!(db.get_pipeline_run("github", "check_77").unwrap().is_some());
    let signal: RawSignal = queues.try_pop(QueueName::RawSignal).unwrap().unwrap();
    assert_eq!(signal.message, "Check 'lint' failed: 3 errors: unused import");
    assert_eq!(signal.branch, "feature");
}

#[test]
fn push_records_commits() {
    let (db, _queues, gw) = setup("", "");
    let body = json!({
        "ref": "refs/heads/main",
        "repository": { "full_name": "acme/app" },
        "commits": [
            { "id": "c1", "message": "first", "author": { "name": "a" }, "timestamp": "2024-05-01T09:00:00Z" },
            { "id": "c2", "message": "second", "author": { "name": "b" }, "timestamp": "2024-05-01T09:30:00Z" },
        ],
    })
    .to_string();

    gw.handle_github("push", None, body.as_bytes()).unwrap();
    let commits = db.recent_commits("acme/app", 10).unwrap();
    assert_eq!(
        commits.iter().map(|c| c.sha.as_str()).collect::<Vec<_>>(),
        vec!["c2", "c1"]
    );
    assert_eq!(commits[0].branch, "main");
}

// ── gitlab ───────────────────────────────────────────────────────────────────

#[test]
fn gitlab_token_must_match() {
    let (_db, queues, gw) = setup("", "gl-token");
    let body = json!({
        "object_attributes": { "id": 900, "status": "failed", "ref": "main", "sha": "aa11" },
        "project": { "path_with_namespace": "acme/api" },
    })
    .to_string();

    let err = gw
        .handle_gitlab("Pipeline Hook", Some("wrong"), body.as_bytes())
        .unwrap_err();
    assert!(matches!(err, GatewayError::Unauthorized(_)));

    gw.handle_gitlab("Pipeline Hook", Some("gl-token"), body.as_bytes())
        .unwrap();
    let signal: RawSignal = queues.try_pop(QueueName::RawSignal).unwrap().unwrap();
    assert_eq!(signal.source_type, "gitlab");
    assert_eq!(signal.source_id, "900");
    assert_eq!(signal.repository, "acme/api");
}

#[test]
fn gitlab_job_hook_includes_failure_reason() {
    let (db, queues, gw) = setup("", "");
    let body = json!({
        "build_id": 31,
        "build_name": "unit-tests",
        "build_status": "failed",
        "build_failure_reason": "script_failure",
        "ref": "main",
        "sha": "bb22",
        "project": { "path_with_namespace": "acme/api" },
    })
    .to_string();

    gw.handle_gitlab("Job Hook", None, body.as_bytes()).unwrap();
    assert!(db.get_pipeline_run("gitlab", "job_31").unwrap().is_some());
    let signal: RawSignal = queues.try_pop(QueueName::RawSignal).unwrap().unwrap();
    assert_eq!(signal.message, "Job 'unit-tests' failed: script_failure");
}

// ── jenkins ──────────────────────────────────────────────────────────────────

#[test]
fn jenkins_build_keyed_by_name_and_number() {
    let (db, queues, gw) = setup(SECRET, SECRET);
    let body = json!({
        "name": "payments",
        "build": {
            "number": 12,
            "phase": "COMPLETED",
            "status": "FAILURE",
            "full_url": "http://jenkins/job/payments/12/",
            "scm": { "branch": "main", "commit": "cc33" },
            "log": "npm ERR! Cannot find module 'express'",
        },
    })
    .to_string();

    let ack = gw.handle_jenkins(body.as_bytes()).unwrap();
    assert_eq!(ack.event, "build_event");

    let run = db.get_pipeline_run("jenkins", "payments_12").unwrap().unwrap();
    assert_eq!(run.status, PipelineStatus::Failed);
    let signal: RawSignal = queues.try_pop(QueueName::RawSignal).unwrap().unwrap();
    assert!(signal.message.contains("Cannot find module 'express'"));
}

#[test]
fn jenkins_without_status_is_running() {
    let (db, queues, gw) = setup("", "");
    let body = json!({ "name": "payments", "build": { "number": 13, "phase": "STARTED" } }).to_string();
    gw.handle_jenkins(body.as_bytes()).unwrap();

    let run = db.get_pipeline_run("jenkins", "payments_13").unwrap().unwrap();
    assert_eq!(run.status, PipelineStatus::Running);
    assert_eq!(queues.depth(QueueName::RawSignal).unwrap(), 0);

    let missing: Value = json!({ "build": { "number": 1 } });
    let err = gw
        .handle_jenkins(missing.to_string().as_bytes())
        .unwrap_err();
    assert!(matches!(err, GatewayError::BadPayload(_)));
}
