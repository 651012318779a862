use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{info, warn};

use crate::{
    db::Db,
    queue::{QueueName, Queues},
    types::{Commit, Platform, PipelineRun, PipelineStatus, RawSignal},
};

type HmacSha256 = Hmac<Sha256>;

/// Webhook rejection reasons, mapped to 403 / 400 / 500 by the HTTP layer.
#[derive(Debug)]
pub enum GatewayError {
    Unauthorized(String),
    BadPayload(String),
    Internal(anyhow::Error),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthorized(m) => write!(f, "unauthorized: {m}"),
            Self::BadPayload(m) => write!(f, "bad payload: {m}"),
            Self::Internal(e) => write!(f, "internal error: {e:#}"),
        }
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookAck {
    pub status: &'static str,
    pub event: String,
}

impl WebhookAck {
    fn received(event: impl Into<String>) -> Self {
        Self {
            status: "received",
            event: event.into(),
        }
    }
}

/// Validate a GitHub webhook signature (X-Hub-Signature-256) in constant time.
/// An empty secret disables the check.
pub fn verify_github_signature(secret: &str, payload: &[u8], signature: Option<&str>) -> bool {
    if secret.is_empty() {
        warn!(platform = "github", "webhook secret not configured, skipping validation");
        return true;
    }
    let Some(signature) = signature else {
        return false;
    };
    let Some(sig) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let sig_bytes = match hex::decode(sig) {
        Ok(b) => b,
        Err(_) => return false,
    };
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(payload);
    mac.verify_slice(&sig_bytes).is_ok()
}

/// GitLab sends the shared secret verbatim in X-Gitlab-Token.
pub fn verify_gitlab_token(secret: &str, token: Option<&str>) -> bool {
    if secret.is_empty() {
        warn!(platform = "gitlab", "webhook secret not configured, skipping validation");
        return true;
    }
    token == Some(secret)
}

// ── Payload helpers ───────────────────────────────────────────────────────

fn s<'a>(v: &'a Value, pointer: &str) -> &'a str {
    v.pointer(pointer).and_then(Value::as_str).unwrap_or("")
}

/// Numeric ids arrive as numbers or strings depending on the platform.
fn id_str(v: &Value, pointer: &str) -> String {
    match v.pointer(pointer) {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    }
}

fn parse_time(v: &Value, pointer: &str) -> Option<DateTime<Utc>> {
    match v.pointer(pointer)? {
        Value::String(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|d| d.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S UTC")
                    .ok()
                    .map(|n| n.and_utc())
            }),
        // Jenkins uses epoch milliseconds.
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

fn parse_body(body: &[u8]) -> Result<Value, GatewayError> {
    serde_json::from_slice(body).map_err(|e| GatewayError::BadPayload(e.to_string()))
}

fn base_run(platform: Platform, external_id: String, status: PipelineStatus) -> PipelineRun {
    PipelineRun {
        id: 0,
        platform: platform.as_str().into(),
        external_id,
        run_number: None,
        status,
        repository: String::new(),
        branch: String::new(),
        commit_sha: String::new(),
        commit_message: String::new(),
        author: String::new(),
        started_at: None,
        finished_at: None,
        logs_url: String::new(),
        metadata: Value::Object(Default::default()),
        incident_id: None,
    }
}

// ── Gateway ───────────────────────────────────────────────────────────────

/// Verifies and normalizes CI webhooks into pipeline runs. Never creates incidents;
/// a terminal failure only produces a raw signal for the classifier.
pub struct Gateway {
    db: Arc<Db>,
    queues: Arc<Queues>,
    github_secret: String,
    gitlab_secret: String,
}

impl Gateway {
    pub fn new(
        db: Arc<Db>,
        queues: Arc<Queues>,
        github_secret: impl Into<String>,
        gitlab_secret: impl Into<String>,
    ) -> Self {
        Self {
            db,
            queues,
            github_secret: github_secret.into(),
            gitlab_secret: gitlab_secret.into(),
        }
    }

    pub fn handle_github(
        &self,
        event: &str,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<WebhookAck, GatewayError> {
        if !verify_github_signature(&self.github_secret, body, signature) {
            warn!(platform = "github", event, "rejected webhook: invalid signature");
            return Err(GatewayError::Unauthorized("invalid signature".into()));
        }
        let payload = parse_body(body)?;
        info!(platform = "github", event, "received webhook");
        match event {
            "workflow_run" => self.github_workflow_run(&payload)?,
            "check_run" => self.github_check_run(&payload)?,
            "push" => self.record_push(
                s(&payload, "/repository/full_name"),
                s(&payload, "/ref"),
                &payload,
            )?,
            "pull_request" => {
                info!(
                    "PR {} #{} in {}",
                    s(&payload, "/action"),
                    id_str(&payload, "/pull_request/number"),
                    s(&payload, "/repository/full_name")
                );
            }
            _ => {}
        }
        Ok(WebhookAck::received(event))
    }

    pub fn handle_gitlab(
        &self,
        event: &str,
        token: Option<&str>,
        body: &[u8],
    ) -> Result<WebhookAck, GatewayError> {
        if !verify_gitlab_token(&self.gitlab_secret, token) {
            warn!(platform = "gitlab", event, "rejected webhook: invalid token");
            return Err(GatewayError::Unauthorized("invalid token".into()));
        }
        let payload = parse_body(body)?;
        info!(platform = "gitlab", event, "received webhook");
        match event {
            "Pipeline Hook" => self.gitlab_pipeline(&payload)?,
            "Job Hook" => self.gitlab_job(&payload)?,
            "Push Hook" => self.record_push(
                s(&payload, "/project/path_with_namespace"),
                s(&payload, "/ref"),
                &payload,
            )?,
            _ => {}
        }
        Ok(WebhookAck::received(event))
    }

    /// Jenkins notification-plugin payloads; trusted network, no verification.
    pub fn handle_jenkins(&self, body: &[u8]) -> Result<WebhookAck, GatewayError> {
        let payload = parse_body(body)?;
        let name = s(&payload, "/name");
        let number = id_str(&payload, "/build/number");
        if name.is_empty() || number.is_empty() {
            return Err(GatewayError::BadPayload("missing name or build.number".into()));
        }
        info!(platform = "jenkins", job = name, build = %number, "received webhook");

        let status = match s(&payload, "/build/status") {
            "" => PipelineStatus::from_jenkins(None),
            status => PipelineStatus::from_jenkins(Some(status)),
        };
        let mut run = base_run(Platform::Jenkins, format!("{name}_{number}"), status);
        run.run_number = number.parse().ok();
        run.repository = match s(&payload, "/repository") {
            "" => s(&payload, "/build/scm/url").to_string(),
            r => r.to_string(),
        };
        run.branch = s(&payload, "/build/scm/branch").to_string();
        run.commit_sha = s(&payload, "/build/scm/commit").to_string();
        run.started_at = parse_time(&payload, "/build/timestamp");
        run.logs_url = s(&payload, "/build/full_url").to_string();
        run.metadata = json!({
            "job_name": name,
            "phase": s(&payload, "/build/phase"),
            "build_url": s(&payload, "/build/full_url"),
        });

        let log = s(&payload, "/build/log");
        let message = if log.is_empty() {
            format!(
                "Pipeline failed: Jenkins job '{name}' build #{number} finished {}",
                s(&payload, "/build/status")
            )
        } else {
            format!("Pipeline failed: Jenkins job '{name}' build #{number}\n{log}")
        };
        self.record_run(run, message)?;
        Ok(WebhookAck::received("build_event"))
    }

    // ── GitHub ────────────────────────────────────────────────────────────

    fn github_workflow_run(&self, payload: &Value) -> anyhow::Result<()> {
        let wr = payload.get("workflow_run").cloned().unwrap_or(Value::Null);
        let conclusion = wr.get("conclusion").and_then(Value::as_str);
        let status = PipelineStatus::from_github(s(&wr, "/status"), conclusion);
        let mut run = base_run(Platform::Github, id_str(&wr, "/id"), status);
        if run.external_id.is_empty() {
            anyhow::bail!("workflow_run without id");
        }
        run.run_number = wr.get("run_number").and_then(Value::as_i64);
        run.repository = s(payload, "/repository/full_name").to_string();
        run.branch = s(&wr, "/head_branch").to_string();
        run.commit_sha = s(&wr, "/head_sha").to_string();
        run.commit_message = s(&wr, "/head_commit/message").to_string();
        run.author = s(&wr, "/head_commit/author/name").to_string();
        run.started_at = parse_time(&wr, "/created_at");
        run.finished_at = parse_time(&wr, "/updated_at");
        run.logs_url = s(&wr, "/logs_url").to_string();
        run.metadata = json!({
            "workflow_name": s(&wr, "/name"),
            "event": s(&wr, "/event"),
            "actor": s(&wr, "/actor/login"),
            "html_url": s(&wr, "/html_url"),
            "action": s(payload, "/action"),
        });
        let message = format!(
            "Pipeline failed: workflow '{}' on {}@{}",
            s(&wr, "/name"),
            run.repository,
            run.branch
        );
        self.record_run(run, message)?;
        Ok(())
    }

    fn github_check_run(&self, payload: &Value) -> anyhow::Result<()> {
        let cr = payload.get("check_run").cloned().unwrap_or(Value::Null);
        if s(payload, "/action") != "completed" || s(&cr, "/conclusion") != "failure" {
            return Ok(());
        }
        let mut run = base_run(
            Platform::Github,
            format!("check_{}", id_str(&cr, "/id")),
            PipelineStatus::Failed,
        );
        run.run_number = Some(1);
        run.repository = s(payload, "/repository/full_name").to_string();
        run.branch = s(&cr, "/check_suite/head_branch").to_string();
        run.commit_sha = s(&cr, "/head_sha").to_string();
        run.metadata = json!({
            "check_name": s(&cr, "/name"),
            "html_url": s(&cr, "/html_url"),
            "output": cr.get("output").cloned().unwrap_or(Value::Null),
        });
        let mut message = format!("Check '{}' failed", s(&cr, "/name"));
        for part in [s(&cr, "/output/title"), s(&cr, "/output/summary")] {
            if !part.is_empty() {
                message.push_str(": ");
                message.push_str(part);
            }
        }
        self.record_run(run, message)?;
        Ok(())
    }

    // ── GitLab ────────────────────────────────────────────────────────────

    fn gitlab_pipeline(&self, payload: &Value) -> anyhow::Result<()> {
        let attrs = payload.get("object_attributes").cloned().unwrap_or(Value::Null);
        let status = PipelineStatus::from_gitlab(s(&attrs, "/status"));
        let mut run = base_run(Platform::Gitlab, id_str(&attrs, "/id"), status);
        if run.external_id.is_empty() {
            anyhow::bail!("pipeline hook without object_attributes.id");
        }
        run.run_number = attrs.get("id").and_then(Value::as_i64);
        run.repository = s(payload, "/project/path_with_namespace").to_string();
        run.branch = s(&attrs, "/ref").to_string();
        run.commit_sha = s(&attrs, "/sha").to_string();
        run.commit_message = s(payload, "/commit/message").to_string();
        run.author = s(payload, "/user/name").to_string();
        run.started_at = parse_time(&attrs, "/created_at");
        run.finished_at = parse_time(&attrs, "/finished_at");
        run.logs_url = s(&attrs, "/url").to_string();
        run.metadata = json!({
            "pipeline_url": s(&attrs, "/url"),
            "source": s(&attrs, "/source"),
            "user": s(payload, "/user/name"),
        });
        let message = format!(
            "Pipeline failed: GitLab pipeline {} on {}@{}",
            run.external_id, run.repository, run.branch
        );
        self.record_run(run, message)?;
        Ok(())
    }

    fn gitlab_job(&self, payload: &Value) -> anyhow::Result<()> {
        let job_id = id_str(payload, "/build_id");
        if job_id.is_empty() {
            anyhow::bail!("job hook without build_id");
        }
        let status = PipelineStatus::from_gitlab(s(payload, "/build_status"));
        let mut run = base_run(Platform::Gitlab, format!("job_{job_id}"), status);
        run.repository = match s(payload, "/project/path_with_namespace") {
            "" => s(payload, "/project_name").to_string(),
            r => r.to_string(),
        };
        run.branch = s(payload, "/ref").to_string();
        run.commit_sha = s(payload, "/sha").to_string();
        run.commit_message = s(payload, "/commit/message").to_string();
        run.started_at = parse_time(payload, "/build_started_at");
        run.finished_at = parse_time(payload, "/build_finished_at");
        run.metadata = json!({
            "job_name": s(payload, "/build_name"),
            "stage": s(payload, "/build_stage"),
            "failure_reason": s(payload, "/build_failure_reason"),
            "pipeline_id": id_str(payload, "/pipeline_id"),
        });
        let mut message = format!("Job '{}' failed", s(payload, "/build_name"));
        let reason = s(payload, "/build_failure_reason");
        if !reason.is_empty() {
            message.push_str(": ");
            message.push_str(reason);
        }
        self.record_run(run, message)?;
        Ok(())
    }

    // ── Shared ────────────────────────────────────────────────────────────

    fn record_push(&self, repository: &str, git_ref: &str, payload: &Value) -> anyhow::Result<()> {
        let branch = git_ref.strip_prefix("refs/heads/").unwrap_or(git_ref);
        let commits = payload
            .get("commits")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for c in &commits {
            let sha = s(c, "/id");
            if sha.is_empty() {
                continue;
            }
            self.db.insert_commit(&Commit {
                repository: repository.to_string(),
                branch: branch.to_string(),
                sha: sha.to_string(),
                message: s(c, "/message").to_string(),
                author: s(c, "/author/name").to_string(),
                pushed_at: parse_time(c, "/timestamp").unwrap_or_else(Utc::now),
            })?;
        }
        info!("push to {repository}:{branch} - {} commits", commits.len());
        Ok(())
    }

    /// Upserts the run and, only on a transition into `failed`, enqueues a raw signal.
    fn record_run(&self, run: PipelineRun, message: String) -> anyhow::Result<bool> {
        let (run_id, previous) = self.db.upsert_pipeline_run(&run)?;
        if !run.commit_sha.is_empty() && !run.repository.is_empty() {
            self.db.insert_commit(&Commit {
                repository: run.repository.clone(),
                branch: run.branch.clone(),
                sha: run.commit_sha.clone(),
                message: run.commit_message.clone(),
                author: run.author.clone(),
                pushed_at: run.started_at.unwrap_or_else(Utc::now),
            })?;
        }
        if run.status != PipelineStatus::Failed || previous == Some(PipelineStatus::Failed) {
            return Ok(false);
        }
        let signal = RawSignal {
            source_type: run.platform.clone(),
            source_id: run.external_id.clone(),
            repository: run.repository.clone(),
            branch: run.branch.clone(),
            commit_sha: run.commit_sha.clone(),
            message,
            level: "ERROR".into(),
            timestamp: Utc::now(),
            metadata: json!({
                "pipeline_run_id": run_id,
                "platform": run.platform,
                "logs_url": run.logs_url,
                "details": run.metadata,
            }),
        };
        self.queues.push(QueueName::RawSignal, &signal)?;
        info!(
            platform = %run.platform,
            external_id = %run.external_id,
            "triggered failure detection for pipeline"
        );
        Ok(true)
    }
}
