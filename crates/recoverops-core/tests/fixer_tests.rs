use std::sync::Arc;

use chrono::Utc;
use recoverops_core::{
    db::Db,
    fixer::{template_fixes, FixGenerator},
    queue::{QueueName, Queues},
    reasoner::HeuristicReasoner,
    types::{
        ChannelKind, FailureType, FixRequest, FixType, Incident, IncidentStatus, NewIncident,
        PipelineEvent, RemediationBatch, RemediationStatus, Severity,
    },
};
use serde_json::Value;
use tokio::sync::broadcast;

// ── helpers ──────────────────────────────────────────────────────────────────

fn open_db() -> Arc<Db> {
    let mut db = Db::open(":memory:").expect("open in-memory db");
    db.migrate().expect("migrate");
    Arc::new(db)
}

fn incident(db: &Db, failure_type: FailureType, error: &str) -> Incident {
    let id = db
        .insert_incident(&NewIncident {
            title: format!("{} in deploy-3", failure_type.label()),
            severity: Severity::High,
            source_type: "github".into(),
            source_id: "deploy-3".into(),
            repository: "acme/payments".into(),
            branch: "main".into(),
            failure_type,
            error_message: error.into(),
            confidence_score: 0.8,
            ..Default::default()
        })
        .expect("insert incident");
    db.get_incident(id).unwrap().unwrap()
}

fn analyzed(db: &Db, failure_type: FailureType, error: &str) -> i64 {
    let inc = incident(db, failure_type, error);
    db.transition_incident(inc.id, IncidentStatus::Analyzing)
        .unwrap();
    inc.id
}

fn request(incident_id: i64) -> FixRequest {
    FixRequest {
        incident_id,
        root_cause: "missing dependency/resource".into(),
        suggested_fixes: vec![],
        confidence: 0.6,
        queued_at: Utc::now(),
    }
}

fn generator(db: &Arc<Db>) -> (FixGenerator, Arc<Queues>, broadcast::Receiver<PipelineEvent>) {
    let queues = Arc::new(Queues::new(Arc::clone(db)));
    let (tx, rx) = broadcast::channel(16);
    let g = FixGenerator::new(
        Arc::clone(db),
        Arc::clone(&queues),
        Arc::new(HeuristicReasoner),
        tx,
    );
    (g, queues, rx)
}

// ── templates ────────────────────────────────────────────────────────────────

#[test]
fn python_module_becomes_requirements_update() {
    let db = open_db();
    let inc = incident(
        &db,
        FailureType::DependencyError,
        "ModuleNotFoundError: No module named 'requests'",
    );
    let fixes = template_fixes(&inc);
    assert_eq!(fixes.len(), 1);
    assert_eq!(fixes[0].fix_type, FixType::DependencyUpdate);
    assert_eq!(fixes[0].target_files, vec!["requirements.txt".to_string()]);
    assert_eq!(fixes[0].content, "requests\n");
    assert_eq!(fixes[0].confidence, 0.85);
}

#[test]
fn node_module_becomes_package_json_merge() {
    let db = open_db();
    let inc = incident(
        &db,
        FailureType::BuildFailure,
        "Error: Cannot find module 'express'",
    );
    let fixes = template_fixes(&inc);
    assert_eq!(fixes.len(), 1);
    assert_eq!(fixes[0].target_files, vec!["package.json".to_string()]);
    let content: Value = serde_json::from_str(&fixes[0].content).unwrap();
    assert_eq!(content["dependencies"]["express"], "latest");
}

#[test]
fn crashloop_with_memory_pressure_gets_manifest_and_restart() {
    let db = open_db();
    let inc = incident(
        &db,
        FailureType::DeploymentFailure,
        "pod payments-7f OOMKilled, CrashLoopBackOff",
    );
    let fixes = template_fixes(&inc);
    let types: Vec<FixType> = fixes.iter().map(|f| f.fix_type).collect();
    assert_eq!(types, vec![FixType::KubernetesFix, FixType::RestartService]);
    assert_eq!(fixes[0].confidence, 0.8);
    assert_eq!(fixes[0].fix_type.channel(), ChannelKind::VersionControl);

    let restart = &fixes[1];
    assert!(restart.retryable);
    assert_eq!(restart.fix_type.channel(), ChannelKind::Infrastructure);
    let content: Value = serde_json::from_str(&restart.content).unwrap();
    assert_eq!(content["action"], "restart");
    assert_eq!(content["target"], "payments");
}

#[test]
fn syntax_and_permission_templates() {
    let db = open_db();
    let yaml = incident(&db, FailureType::SyntaxError, "YAML parse error at line 4");
    assert_eq!(template_fixes(&yaml)[0].fix_type, FixType::YamlFix);

    let json = incident(&db, FailureType::ConfigurationError, "invalid json in config");
    let f = &template_fixes(&json)[0];
    assert_eq!(f.fix_type, FixType::ConfigFix);
    assert_eq!(f.confidence, 0.7);

    let docker = incident(&db, FailureType::PermissionError, "docker: permission denied");
    assert_eq!(template_fixes(&docker)[0].fix_type, FixType::DockerfileFix);

    let script = incident(&db, FailureType::PermissionError, "./deploy.sh: permission denied");
    assert_eq!(template_fixes(&script)[0].fix_type, FixType::ScriptFix);
}

#[test]
fn connection_refused_restarts_service() {
    let db = open_db();
    let inc = incident(&db, FailureType::NetworkError, "dial tcp 10.0.0.4:5432: connection refused");
    let fixes = template_fixes(&inc);
    assert_eq!(fixes.len(), 1);
    assert_eq!(fixes[0].fix_type, FixType::RestartService);
    assert_eq!(fixes[0].confidence, 0.6);
}

#[test]
fn unknown_and_test_failures_have_no_template() {
    let db = open_db();
    let t = incident(&db, FailureType::TestFailure, "assert 1 == 2");
    assert!(template_fixes(&t).is_empty());
    let u = incident(&db, FailureType::Unknown, "weird");
    assert!(template_fixes(&u).is_empty());
}

// ── generator stage ──────────────────────────────────────────────────────────

#[tokio::test]
async fn fixes_are_persisted_and_batched() {
    let db = open_db();
    let (g, queues, mut rx) = generator(&db);
    let id = analyzed(
        &db,
        FailureType::DeploymentFailure,
        "OOMKilled; CrashLoopBackOff",
    );

    let ids = g.process(&request(id)).await.unwrap();
    assert_eq!(ids.len(), 2);

    let rows = db.list_remediations(id).unwrap();
    assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), ids);
    assert!(rows.iter().all(|r| r.status == RemediationStatus::Pending));
    assert!(rows[1].retryable);

    let batch: RemediationBatch = queues.try_pop(QueueName::Remediation).unwrap().unwrap();
    assert_eq!(batch.incident_id, id);
    assert!(!batch.manual_trigger);
    assert_eq!(
        batch.fixes.iter().map(|f| f.remediation_id).collect::<Vec<_>>(),
        ids
    );
    assert!(batch.fixes[1].retryable);

    assert!(matches!(
        rx.try_recv().unwrap(),
        PipelineEvent::FixesGenerated { count: 2, .. }
    ));

    // Redelivery does not duplicate pending remediations.
    assert!(g.process(&request(id)).await.unwrap().is_empty());
    assert_eq!(db.list_remediations(id).unwrap().len(), 2);

    // Incident status is left for the executor to advance.
    assert_eq!(
        db.get_incident(id).unwrap().unwrap().status,
        IncidentStatus::Analyzing
    );
}

#[tokio::test]
async fn no_fixes_leaves_incident_at_analyzing() {
    let db = open_db();
    let (g, queues, _rx) = generator(&db);
    let id = analyzed(&db, FailureType::TestFailure, "expected 3 but got 4");

    assert!(g.process(&request(id)).await.unwrap().is_empty());
    assert_eq!(queues.depth(QueueName::Remediation).unwrap(), 0);
    assert_eq!(
        db.get_incident(id).unwrap().unwrap().status,
        IncidentStatus::Analyzing
    );
}

#[tokio::test]
async fn incident_not_yet_analyzed_is_skipped() {
    let db = open_db();
    let (g, queues, _rx) = generator(&db);
    let inc = incident(&db, FailureType::DependencyError, "No module named 'requests'");

    assert!(g.process(&request(inc.id)).await.unwrap().is_empty());
    assert_eq!(queues.depth(QueueName::Remediation).unwrap(), 0);
}
