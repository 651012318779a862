use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    analyzer::{mentions_oom, missing_node_module, missing_python_module},
    db::Db,
    pipeline::Stage,
    queue::{QueueName, Queues},
    reasoner::Reasoner,
    types::{
        FailureType, FixRequest, FixSpec, FixType, GeneratedFix, Incident, IncidentStatus,
        PipelineEvent, RemediationBatch, RemediationStatus,
    },
};

const K8S_MEMORY_PATCH: &str = r#"# Increase memory limits
resources:
  limits:
    memory: "512Mi"
    cpu: "500m"
  requests:
    memory: "256Mi"
    cpu: "250m"
"#;

const K8S_IMAGE_PULL_PATCH: &str = r#"# Fix image pull configuration
spec:
  template:
    spec:
      imagePullSecrets:
      - name: regcred
      containers:
      - name: app
        imagePullPolicy: Always
"#;

const NON_ROOT_DOCKERFILE: &str = r#"# Run as a non-root user with owned workdir
FROM python:3.11-slim

RUN groupadd -r appuser && useradd -r -g appuser appuser

WORKDIR /app
COPY requirements.txt .
RUN pip install -r requirements.txt

COPY . .
RUN chown -R appuser:appuser /app

USER appuser
CMD ["python", "app.py"]
"#;

fn steps(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn fix(
    fix_type: FixType,
    description: impl Into<String>,
    content: impl Into<String>,
    target_files: &[&str],
    confidence: f64,
    validation: Vec<String>,
) -> GeneratedFix {
    GeneratedFix {
        fix_type,
        description: description.into(),
        content: content.into(),
        target_files: target_files.iter().map(|s| s.to_string()).collect(),
        confidence,
        validation_steps: validation,
        retryable: false,
    }
}

/// Deployment or service name an operational fix should act on.
fn infra_target(incident: &Incident) -> String {
    incident
        .repository
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(incident.source_id.as_str())
        .to_string()
}

fn restart_fix(incident: &Incident, description: &str, confidence: f64) -> GeneratedFix {
    let mut f = fix(
        FixType::RestartService,
        description,
        json!({ "action": "restart", "target": infra_target(incident) }).to_string(),
        &[],
        confidence,
        steps(&["Check pod status", "Watch restart count", "Tail service logs"]),
    );
    f.retryable = true;
    f
}

fn dependency_fixes(incident: &Incident, lower: &str) -> Vec<GeneratedFix> {
    if let Some(pkg) = missing_python_module(&incident.error_message) {
        return vec![fix(
            FixType::DependencyUpdate,
            format!("Add missing Python package: {pkg}"),
            format!("{pkg}\n"),
            &["requirements.txt"],
            0.85,
            vec![
                format!("pip install {pkg}"),
                "Run tests".into(),
                "Verify import works".into(),
            ],
        )];
    }
    if let Some(pkg) = missing_node_module(&incident.error_message) {
        let mut deps = serde_json::Map::new();
        deps.insert(pkg.clone(), json!("latest"));
        return vec![fix(
            FixType::DependencyUpdate,
            format!("Add missing Node.js package: {pkg}"),
            json!({ "dependencies": deps }).to_string(),
            &["package.json"],
            0.85,
            vec![
                format!("npm install {pkg}"),
                "npm test".into(),
                "Verify require() works".into(),
            ],
        )];
    }
    if lower.contains("not found") || lower.contains("could not resolve") {
        return vec![fix(
            FixType::DependencyUpdate,
            "Update dependencies to resolve missing packages",
            "# Add missing dependencies\n# Check requirements.txt or package.json\n",
            &["requirements.txt", "package.json"],
            0.6,
            steps(&["Install dependencies", "Run build process", "Verify functionality"]),
        )];
    }
    Vec::new()
}

fn syntax_fixes(lower: &str) -> Vec<GeneratedFix> {
    let f = if lower.contains("yaml") || lower.contains("yml") {
        fix(
            FixType::YamlFix,
            "Fix YAML syntax errors",
            "# Common YAML fixes:\n# - Fix indentation\n# - Add quotes around strings\n# - Remove trailing commas\n",
            &["*.yaml", "*.yml"],
            0.7,
            steps(&["Validate YAML syntax", "Test configuration", "Apply changes"]),
        )
    } else if lower.contains("json") {
        fix(
            FixType::ConfigFix,
            "Fix JSON syntax errors",
            "# Common JSON fixes:\n# - Remove trailing commas\n# - Add quotes around keys\n# - Fix bracket matching\n",
            &["*.json"],
            0.7,
            steps(&["Validate JSON syntax", "Test configuration", "Apply changes"]),
        )
    } else {
        fix(
            FixType::ConfigFix,
            "Fix configuration syntax errors",
            "# Review and fix syntax in configuration files\n",
            &["*.yaml", "*.yml", "*.json"],
            0.6,
            steps(&["Validate YAML/JSON syntax", "Test configuration", "Deploy changes"]),
        )
    };
    vec![f]
}

fn permission_fixes(lower: &str) -> Vec<GeneratedFix> {
    if lower.contains("docker") {
        return vec![fix(
            FixType::DockerfileFix,
            "Fix Docker permission issues",
            NON_ROOT_DOCKERFILE,
            &["Dockerfile"],
            0.8,
            steps(&["Build Docker image", "Run container", "Verify permissions"]),
        )];
    }
    vec![fix(
        FixType::ScriptFix,
        "Fix permission issues",
        "# Fix file permissions\nchmod +x script.sh\n# Or update Dockerfile USER directive\n",
        &["Dockerfile", "scripts/*"],
        0.75,
        steps(&["Check file permissions", "Test script execution", "Verify container startup"]),
    )]
}

fn infrastructure_fixes(incident: &Incident, lower: &str) -> Vec<GeneratedFix> {
    let mut out = Vec::new();
    if lower.contains("memory") || mentions_oom(lower) {
        out.push(fix(
            FixType::KubernetesFix,
            "Increase memory limits to prevent OOM kills",
            K8S_MEMORY_PATCH,
            &["deployment.yaml", "k8s/deployment.yaml"],
            0.8,
            steps(&["Apply the updated deployment", "Check pod status", "Monitor memory usage"]),
        ));
    } else if lower.contains("imagepullbackoff") || lower.contains("errimagepull") {
        out.push(fix(
            FixType::KubernetesFix,
            "Fix image pull configuration",
            K8S_IMAGE_PULL_PATCH,
            &["deployment.yaml"],
            0.75,
            steps(&["Verify image exists in registry", "Check image pull secrets", "Apply deployment"]),
        ));
    } else if lower.contains("resource") && lower.contains("limit") {
        out.push(fix(
            FixType::ConfigFix,
            "Increase resource limits",
            "# Increase CPU/memory limits in configuration\n",
            &["deployment.yaml", "docker-compose.yml"],
            0.6,
            steps(&["Update resource limits", "Redeploy application", "Monitor resource usage"]),
        ));
    }
    if lower.contains("crashloopbackoff") {
        out.push(restart_fix(incident, "Restart the crash-looping service", 0.7));
    }
    out
}

/// Deterministic fixes keyed on failure type and error message.
pub fn template_fixes(incident: &Incident) -> Vec<GeneratedFix> {
    let lower = incident.error_message.to_ascii_lowercase();
    match incident.failure_type {
        FailureType::DependencyError => dependency_fixes(incident, &lower),
        FailureType::BuildFailure => {
            let deps = dependency_fixes(incident, &lower);
            if deps.is_empty() && lower.contains("docker") && lower.contains("permission") {
                permission_fixes(&lower)
            } else {
                deps
            }
        }
        FailureType::SyntaxError | FailureType::ConfigurationError => syntax_fixes(&lower),
        FailureType::PermissionError => permission_fixes(&lower),
        FailureType::DeploymentFailure | FailureType::ResourceError => {
            infrastructure_fixes(incident, &lower)
        }
        FailureType::NetworkError if lower.contains("connection refused") => {
            vec![restart_fix(incident, "Restart the unreachable service", 0.6)]
        }
        FailureType::NetworkError
        | FailureType::TestFailure
        | FailureType::TimeoutError
        | FailureType::SecurityError
        | FailureType::Unknown => Vec::new(),
    }
}

// ── Fix generator stage ───────────────────────────────────────────────────

/// Consumes analyzed incidents, persists candidate fixes as pending remediations
/// and batches them for the executor.
pub struct FixGenerator {
    db: Arc<Db>,
    queues: Arc<Queues>,
    reasoner: Arc<dyn Reasoner>,
    event_tx: broadcast::Sender<PipelineEvent>,
}

impl FixGenerator {
    pub fn new(
        db: Arc<Db>,
        queues: Arc<Queues>,
        reasoner: Arc<dyn Reasoner>,
        event_tx: broadcast::Sender<PipelineEvent>,
    ) -> Self {
        Self {
            db,
            queues,
            reasoner,
            event_tx,
        }
    }

    /// Returns the ids of the remediations created. An empty result leaves the
    /// incident at analyzing for manual follow-up.
    pub async fn process(&self, req: &FixRequest) -> Result<Vec<i64>> {
        let Some(incident) = self.db.get_incident(req.incident_id)? else {
            warn!(incident_id = req.incident_id, "incident not found, skipping fix generation");
            return Ok(Vec::new());
        };
        if incident.status != IncidentStatus::Analyzing {
            info!(
                incident_id = incident.id,
                status = incident.status.as_str(),
                "incident not awaiting fixes, skipping"
            );
            return Ok(Vec::new());
        }
        let pending = self
            .db
            .list_remediations_with_status(incident.id, RemediationStatus::Pending)?;
        if !pending.is_empty() {
            info!(
                incident_id = incident.id,
                pending = pending.len(),
                "pending remediations already exist, skipping generation"
            );
            return Ok(Vec::new());
        }

        let fixes = self.reasoner.propose_fixes(&incident, req).await;
        if fixes.is_empty() {
            warn!(
                incident_id = incident.id,
                failure_type = incident.failure_type.as_str(),
                "no fixes generated; incident stays at analyzing pending manual intervention"
            );
            return Ok(Vec::new());
        }

        let mut specs = Vec::with_capacity(fixes.len());
        for f in &fixes {
            let id = self.db.insert_remediation(incident.id, f)?;
            specs.push(FixSpec {
                remediation_id: id,
                fix_type: f.fix_type,
                description: f.description.clone(),
                content: f.content.clone(),
                target_files: f.target_files.clone(),
                confidence: f.confidence,
                retryable: f.retryable,
            });
        }
        let ids: Vec<i64> = specs.iter().map(|s| s.remediation_id).collect();

        self.queues.push(
            QueueName::Remediation,
            &RemediationBatch {
                incident_id: incident.id,
                fixes: specs,
                queued_at: Utc::now(),
                manual_trigger: false,
            },
        )?;
        info!(
            incident_id = incident.id,
            count = ids.len(),
            reasoner = self.reasoner.name(),
            "generated fixes"
        );
        let _ = self.event_tx.send(PipelineEvent::FixesGenerated {
            incident_id: incident.id,
            count: ids.len(),
        });
        Ok(ids)
    }
}

#[async_trait]
impl Stage for FixGenerator {
    fn name(&self) -> &'static str {
        "fixer"
    }

    async fn step(&self) -> Result<()> {
        let req: FixRequest = self.queues.recv(QueueName::Fix).await?;
        self.process(&req).await?;
        Ok(())
    }
}
