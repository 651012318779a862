use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use recoverops_core::{
    analyzer::Analyzer,
    db::Db,
    queue::{QueueName, Queues},
    reasoner::{AnalysisContext, HeuristicReasoner, Reasoner},
    types::{
        Commit, FailureType, FixRequest, GeneratedFix, Incident, IncidentMessage,
        IncidentStatus, NewIncident, PipelineEvent, RootCauseAnalysis, Severity,
    },
};
use serde_json::json;
use tokio::sync::broadcast;

// ── helpers ──────────────────────────────────────────────────────────────────

fn open_db() -> Arc<Db> {
    let mut db = Db::open(":memory:").expect("open in-memory db");
    db.migrate().expect("migrate");
    Arc::new(db)
}

fn insert(db: &Db, source_id: &str, failure_type: FailureType, error: &str) -> i64 {
    db.insert_incident(&NewIncident {
        title: format!("{} in {source_id}", failure_type.label()),
        severity: Severity::High,
        source_type: "github".into(),
        source_id: source_id.into(),
        repository: "acme/app".into(),
        branch: "main".into(),
        failure_type,
        error_message: error.into(),
        confidence_score: 0.85,
        analysis_data: json!({ "pattern_name": "dependency_missing" }),
        ..Default::default()
    })
    .expect("insert incident")
}

fn message(incident_id: i64) -> IncidentMessage {
    IncidentMessage {
        incident_id,
        failure_type: FailureType::DependencyError,
        severity: Severity::High,
        message: String::new(),
        queued_at: Utc::now(),
    }
}

/// Returns a fixed analysis and records the context it was given.
struct FixedReasoner {
    confidence: f64,
    seen: Mutex<Option<AnalysisContext>>,
}

#[async_trait]
impl Reasoner for FixedReasoner {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn explain(&self, _incident: &Incident, ctx: &AnalysisContext) -> RootCauseAnalysis {
        *self.seen.lock().unwrap() = Some(ctx.clone());
        RootCauseAnalysis {
            root_cause: "lockfile drift".into(),
            confidence: self.confidence,
            explanation: "requirements.txt and lockfile disagree".into(),
            suggested_fixes: vec!["Regenerate the lockfile".into()],
            method: "llm".into(),
        }
    }

    async fn propose_fixes(&self, _incident: &Incident, _req: &FixRequest) -> Vec<GeneratedFix> {
        Vec::new()
    }
}

// ── tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn missing_python_module_without_model() {
    let db = open_db();
    let queues = Arc::new(Queues::new(Arc::clone(&db)));
    let (tx, mut rx) = broadcast::channel(16);
    let analyzer = Analyzer::new(
        Arc::clone(&db),
        Arc::clone(&queues),
        Arc::new(HeuristicReasoner),
        tx,
    );
    let id = insert(
        &db,
        "build-7",
        FailureType::DependencyError,
        "ModuleNotFoundError: No module named 'requests'",
    );

    let analysis = analyzer.process(&message(id)).await.unwrap().unwrap();
    assert_eq!(analysis.root_cause, "missing dependency/resource");
    assert_eq!(analysis.confidence, 0.6);
    assert!(analysis
        .suggested_fixes
        .iter()
        .any(|f| f.contains("requirements.txt") && f.contains("requests")));

    let inc = db.get_incident(id).unwrap().unwrap();
    assert_eq!(inc.status, IncidentStatus::Analyzing);
    assert_eq!(inc.root_cause.as_deref(), Some("missing dependency/resource"));
    assert_eq!(inc.confidence_score, 0.6);
    assert_eq!(
        inc.analysis_data["root_cause_analysis"]["method"],
        "pattern_analysis"
    );
    assert_eq!(inc.analysis_data["pattern_name"], "dependency_missing");

    let req: FixRequest = queues.try_pop(QueueName::Fix).unwrap().unwrap();
    assert_eq!(req.incident_id, id);
    assert_eq!(req.root_cause, "missing dependency/resource");
    assert_eq!(req.suggested_fixes, analysis.suggested_fixes);

    assert!(matches!(
        rx.try_recv().unwrap(),
        PipelineEvent::Analyzed { incident_id, .. } if incident_id == id
    ));
}

#[tokio::test]
async fn redelivered_message_is_ignored() {
    let db = open_db();
    let queues = Arc::new(Queues::new(Arc::clone(&db)));
    let (tx, _rx) = broadcast::channel(16);
    let analyzer = Analyzer::new(
        Arc::clone(&db),
        Arc::clone(&queues),
        Arc::new(HeuristicReasoner),
        tx,
    );
    let id = insert(&db, "build-7", FailureType::BuildFailure, "exit code 2");

    assert!(analyzer.process(&message(id)).await.unwrap().is_some());
    assert!(analyzer.process(&message(id)).await.unwrap().is_none());
    assert!(analyzer.process(&message(9999)).await.unwrap().is_none());
    assert_eq!(queues.depth(QueueName::Fix).unwrap(), 1);
}

#[tokio::test]
async fn reasoner_confidence_is_clamped_and_context_gathered() {
    let db = open_db();
    let queues = Arc::new(Queues::new(Arc::clone(&db)));
    let (tx, _rx) = broadcast::channel(16);
    let reasoner = Arc::new(FixedReasoner {
        confidence: 1.4,
        seen: Mutex::new(None),
    });
    let analyzer = Analyzer::new(
        Arc::clone(&db),
        Arc::clone(&queues),
        Arc::clone(&reasoner) as Arc<dyn Reasoner>,
        tx,
    );

    // A previously resolved incident with the same failure type and repository.
    let old = insert(&db, "build-1", FailureType::DependencyError, "No module named 'x'");
    for to in [
        IncidentStatus::Analyzing,
        IncidentStatus::Fixing,
        IncidentStatus::Resolved,
    ] {
        db.transition_incident(old, to).unwrap();
    }
    db.insert_log_entry("github", "build-7", "ERROR", "pip install failed", &json!({}))
        .unwrap();
    db.insert_log_entry("github", "build-7", "INFO", "collecting", &json!({}))
        .unwrap();
    db.insert_commit(&Commit {
        repository: "acme/app".into(),
        branch: "main".into(),
        sha: "abc123".into(),
        message: "pin requests".into(),
        author: "dev".into(),
        pushed_at: Utc::now(),
    })
    .unwrap();

    let id = insert(&db, "build-7", FailureType::DependencyError, "No module named 'requests'");
    let analysis = analyzer.process(&message(id)).await.unwrap().unwrap();
    assert_eq!(analysis.confidence, 1.0);
    assert_eq!(db.get_incident(id).unwrap().unwrap().confidence_score, 1.0);

    let ctx = reasoner.seen.lock().unwrap().clone().expect("context passed");
    assert_eq!(ctx.logs.len(), 1);
    assert_eq!(ctx.recent_changes.len(), 1);
    assert_eq!(
        ctx.similar_incidents.iter().map(|i| i.id).collect::<Vec<_>>(),
        vec![old]
    );

    let stored = &db.get_incident(id).unwrap().unwrap().analysis_data["root_cause_analysis"];
    assert_eq!(stored["reasoner"], "fixed");
    assert_eq!(stored["context"]["logs"], 1);
}
