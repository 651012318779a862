use std::sync::Arc;

use chrono::Utc;
use recoverops_core::{
    classifier::{Classifier, Rule},
    db::Db,
    gateway::Gateway,
    queue::{QueueName, Queues},
    types::{
        FailureType, IncidentMessage, IncidentStatus, PipelineEvent, RawSignal, Severity,
    },
};
use serde_json::json;
use tokio::sync::broadcast;
use tracing_test::traced_test;

// ── helpers ──────────────────────────────────────────────────────────────────

struct Harness {
    db: Arc<Db>,
    queues: Arc<Queues>,
    classifier: Classifier,
    events: broadcast::Receiver<PipelineEvent>,
}

fn harness() -> Harness {
    let mut db = Db::open(":memory:").expect("open in-memory db");
    db.migrate().expect("migrate");
    let db = Arc::new(db);
    let queues = Arc::new(Queues::new(Arc::clone(&db)));
    let (tx, rx) = broadcast::channel(16);
    let classifier =
        Classifier::new(Arc::clone(&db), Arc::clone(&queues), tx, 3600).expect("classifier");
    Harness {
        db,
        queues,
        classifier,
        events: rx,
    }
}

fn signal(source_id: &str, message: &str) -> RawSignal {
    RawSignal {
        source_type: "github".into(),
        source_id: source_id.into(),
        repository: "acme/app".into(),
        branch: "main".into(),
        commit_sha: "abc123".into(),
        message: message.into(),
        level: "ERROR".into(),
        timestamp: Utc::now(),
        metadata: json!({}),
    }
}

// ── classification ───────────────────────────────────────────────────────────

#[test]
fn highest_confidence_rule_wins() {
    let h = harness();
    // Matches test_assertion_failure (0.8) and kubernetes_deployment_failed (0.9).
    let c = h
        .classifier
        .classify("container test failed: pod crashed", "ERROR");
    assert_eq!(c.failure_type, FailureType::DeploymentFailure);
    assert_eq!(c.confidence, 0.9);
    assert_eq!(c.method, "pattern_matching");
}

#[test]
fn equal_confidence_keeps_first_declared_rule() {
    let h = harness();
    let rules = vec![
        Rule::new("first", "boom", FailureType::BuildFailure, Severity::High, 0.8, "first").unwrap(),
        Rule::new("second", "boom", FailureType::TestFailure, Severity::Low, 0.8, "second").unwrap(),
        Rule::new("weaker", "boom", FailureType::NetworkError, Severity::Low, 0.5, "weaker").unwrap(),
    ];
    let classifier = h.classifier.with_rules(rules);
    let c = classifier.classify("BOOM at step 3", "ERROR");
    assert_eq!(c.pattern_name, "first");
    assert_eq!(c.failure_type, FailureType::BuildFailure);
}

#[test]
fn missing_python_module_is_a_dependency_error() {
    let h = harness();
    let c = h
        .classifier
        .classify("ModuleNotFoundError: No module named 'requests'", "ERROR");
    assert_eq!(c.failure_type, FailureType::DependencyError);
    assert_eq!(c.pattern_name, "dependency_missing");
}

#[test]
fn unmatched_signal_is_unknown_low_confidence() {
    let h = harness();
    let c = h.classifier.classify("something odd happened", "INFO");
    assert_eq!(c.failure_type, FailureType::Unknown);
    assert_eq!(c.confidence, 0.3);
    assert_eq!(c.severity, Severity::Low);

    let c = h.classifier.classify("something odd happened", "ERROR");
    assert_eq!(c.failure_type, FailureType::Unknown);
    assert_eq!(c.confidence, 0.5);
}

// ── incident creation ────────────────────────────────────────────────────────

#[test]
fn webhook_failure_becomes_detected_incident() {
    let mut h = harness();
    let gateway = Gateway::new(Arc::clone(&h.db), Arc::clone(&h.queues), "", "");
    let body = json!({
        "action": "completed",
        "workflow_run": {
            "id": 555, "name": "CI", "status": "completed", "conclusion": "failure",
            "head_branch": "main", "head_sha": "abc123",
        },
        "repository": { "full_name": "acme/app" },
    })
    .to_string();
    gateway
        .handle_github("workflow_run", None, body.as_bytes())
        .unwrap();

    let raw: RawSignal = h.queues.try_pop(QueueName::RawSignal).unwrap().unwrap();
    let id = h.classifier.process(&raw).unwrap().expect("incident created");

    let inc = h.db.get_incident(id).unwrap().unwrap();
    assert_eq!(inc.status, IncidentStatus::Detected);
    assert_eq!(inc.failure_type, FailureType::BuildFailure);
    assert_eq!(inc.repository, "acme/app");
    assert_eq!(inc.branch, "main");
    assert_eq!(inc.commit_sha, "abc123");
    assert_eq!(inc.title, "Build Failure in 555");
    assert_eq!(inc.analysis_data["detection_method"], "keyword_heuristic");

    let run = h.db.get_pipeline_run("github", "555").unwrap().unwrap();
    assert_eq!(run.incident_id, Some(id));

    let msg: IncidentMessage = h.queues.try_pop(QueueName::Incident).unwrap().unwrap();
    assert_eq!(msg.incident_id, id);
    assert_eq!(msg.failure_type, FailureType::BuildFailure);

    match h.events.try_recv().unwrap() {
        PipelineEvent::Detected { incident_id, .. } => assert_eq!(incident_id, id),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(h.db.recent_error_logs("555", 10).unwrap().len(), 1);
}

#[traced_test]
#[test]
fn identical_signals_inside_window_create_one_incident() {
    let h = harness();
    let s = signal("build-42", "error: compilation failed in src/main.rs");

    let first = h.classifier.process(&s).unwrap();
    let second = h.classifier.process(&s).unwrap();

    assert!(first.is_some());
    assert_eq!(second, None);
    assert_eq!(h.queues.depth(QueueName::Incident).unwrap(), 1);
    assert_eq!(
        h.db.list_incidents(&Default::default()).unwrap().len(),
        1
    );
    assert!(logs_contain("suppressing duplicate"));
}

#[test]
fn different_failure_type_is_not_a_duplicate() {
    let h = harness();
    h.classifier
        .process(&signal("build-42", "error: compilation failed"))
        .unwrap();
    let other = h
        .classifier
        .process(&signal("build-42", "No module named 'yaml'"))
        .unwrap();
    assert!(other.is_some());
}

#[test]
fn closed_incident_does_not_suppress() {
    let h = harness();
    let s = signal("build-42", "error: compilation failed");
    let id = h.classifier.process(&s).unwrap().unwrap();
    for to in [
        IncidentStatus::Analyzing,
        IncidentStatus::Fixing,
        IncidentStatus::Failed,
    ] {
        h.db.transition_incident(id, to).unwrap();
    }
    assert!(h.classifier.process(&s).unwrap().is_some());
}
