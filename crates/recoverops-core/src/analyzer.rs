use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    db::Db,
    pipeline::Stage,
    queue::{QueueName, Queues},
    reasoner::{AnalysisContext, Reasoner},
    types::{
        clamp_confidence, FailureType, FixRequest, Incident, IncidentMessage, IncidentStatus,
        PipelineEvent, RootCauseAnalysis,
    },
};

const CONTEXT_LOG_LIMIT: i64 = 50;
const CONTEXT_COMMIT_LIMIT: i64 = 10;
const CONTEXT_SIMILAR_LIMIT: i64 = 5;
const PATTERN_CONFIDENCE: f64 = 0.6;

const MISSING_MARKERS: &[&str] = &[
    "not found",
    "missing",
    "no module named",
    "modulenotfounderror",
    "cannot find module",
    "could not resolve",
];

// ── Message heuristics ────────────────────────────────────────────────────

/// The token following `marker`, honouring single or double quotes.
fn quoted_after(message: &str, marker: &str) -> Option<String> {
    let lower = message.to_ascii_lowercase();
    let idx = lower.find(marker)?;
    let rest = message[idx + marker.len()..].trim_start();
    let token = match rest.chars().next()? {
        q @ ('\'' | '"' | '`') => rest[1..].split(q).next()?,
        _ => rest.split(|c: char| c.is_whitespace() || c == ';' || c == ',').next()?,
    };
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// `ModuleNotFoundError: No module named 'requests.adapters'` -> `requests`
pub fn missing_python_module(message: &str) -> Option<String> {
    let name = quoted_after(message, "no module named")?;
    let top = name.split('.').next()?.to_string();
    (!top.is_empty()).then_some(top)
}

/// `Error: Cannot find module 'express'` -> `express`. Relative paths are not packages.
pub fn missing_node_module(message: &str) -> Option<String> {
    let name = quoted_after(message, "cannot find module")?;
    if name.starts_with('.') || name.starts_with('/') {
        return None;
    }
    Some(name)
}

pub(crate) fn mentions_oom(lower: &str) -> bool {
    lower.contains("out of memory")
        || lower
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|w| w == "oom" || w == "oomkilled")
}

/// Ordered most-specific-first keyword checks over the error message.
pub fn pattern_root_cause(message: &str, failure_type: FailureType) -> String {
    let lower = message.to_ascii_lowercase();
    let any = |words: &[&str]| words.iter().any(|w| lower.contains(w));
    if any(MISSING_MARKERS) {
        "missing dependency/resource".into()
    } else if any(&["permission denied", "access denied"]) {
        "permission issue".into()
    } else if any(&["timeout", "timed out"]) {
        "network or service timeout".into()
    } else if mentions_oom(&lower) {
        "memory exhaustion".into()
    } else if any(&["syntax error", "parse error"]) {
        "config/code syntax error".into()
    } else if any(&["connection refused", "connection failed"]) {
        "connectivity issue".into()
    } else {
        format!("generic {} issue", failure_type.as_str().replace('_', " "))
    }
}

pub fn pattern_suggested_fixes(message: &str, failure_type: FailureType) -> Vec<String> {
    let lower = message.to_ascii_lowercase();
    let base: &[&str] = match failure_type {
        FailureType::BuildFailure => &[
            "Check and update dependencies in package.json/requirements.txt",
            "Verify build tool configuration",
            "Clear build cache and retry",
            "Check for syntax errors in source code",
        ],
        FailureType::TestFailure => &[
            "Review failing test assertions",
            "Check test data setup and mocks",
            "Verify test environment configuration",
            "Update test dependencies",
        ],
        FailureType::DeploymentFailure => &[
            "Check resource limits and quotas",
            "Verify deployment configuration",
            "Check network connectivity and DNS",
            "Validate credentials and permissions",
        ],
        FailureType::DependencyError => &[
            "Update package registry configuration",
            "Check package version compatibility",
            "Clear dependency cache",
            "Verify network access to package registry",
        ],
        _ => &[
            "Review error logs for specific details",
            "Check system resources and configuration",
            "Verify network connectivity",
            "Consult documentation for the failing component",
        ],
    };

    let lead = if let Some(pkg) = missing_python_module(message) {
        Some(format!("Add missing dependency '{pkg}' to requirements.txt"))
    } else if let Some(pkg) = missing_node_module(message) {
        Some(format!("Add missing dependency '{pkg}' to package.json"))
    } else if MISSING_MARKERS.iter().any(|w| lower.contains(w)) {
        Some("Install or configure the missing component".to_string())
    } else if lower.contains("permission") {
        Some("Fix file permissions or access rights".to_string())
    } else if lower.contains("timeout") {
        Some("Increase timeout values or check network connectivity".to_string())
    } else {
        None
    };

    lead.into_iter()
        .chain(base.iter().map(|s| s.to_string()))
        .take(5)
        .collect()
}

pub fn heuristic_analysis(incident: &Incident) -> RootCauseAnalysis {
    let root_cause = pattern_root_cause(&incident.error_message, incident.failure_type);
    RootCauseAnalysis {
        explanation: format!("Pattern-based analysis identified {root_cause} as the likely cause"),
        suggested_fixes: pattern_suggested_fixes(&incident.error_message, incident.failure_type),
        root_cause,
        confidence: PATTERN_CONFIDENCE,
        method: "pattern_analysis".into(),
    }
}

// ── Analyzer stage ────────────────────────────────────────────────────────

/// Consumes detected incidents, records a root-cause hypothesis and hands the
/// incident to the fix generator.
pub struct Analyzer {
    db: Arc<Db>,
    queues: Arc<Queues>,
    reasoner: Arc<dyn Reasoner>,
    event_tx: broadcast::Sender<PipelineEvent>,
}

impl Analyzer {
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

    pub fn gather_context(&self, incident: &Incident) -> Result<AnalysisContext> {
        let logs = self
            .db
            .recent_error_logs(&incident.source_id, CONTEXT_LOG_LIMIT)?;
        let recent_changes = if incident.repository.is_empty() {
            Vec::new()
        } else {
            self.db
                .recent_commits(&incident.repository, CONTEXT_COMMIT_LIMIT)?
        };
        let similar_incidents = self.db.list_resolved_similar(
            incident.failure_type,
            &incident.repository,
            incident.id,
            CONTEXT_SIMILAR_LIMIT,
        )?;
        Ok(AnalysisContext {
            logs,
            recent_changes,
            similar_incidents,
        })
    }

    /// Returns the analysis when it was recorded, `None` when the message was stale.
    pub async fn process(&self, msg: &IncidentMessage) -> Result<Option<RootCauseAnalysis>> {
        let Some(incident) = self.db.get_incident(msg.incident_id)? else {
            warn!(incident_id = msg.incident_id, "incident not found, skipping analysis");
            return Ok(None);
        };
        if incident.status != IncidentStatus::Detected {
            info!(
                incident_id = incident.id,
                status = incident.status.as_str(),
                "incident already past detection, skipping analysis"
            );
            return Ok(None);
        }

        let ctx = self.gather_context(&incident)?;
        let mut analysis = self.reasoner.explain(&incident, &ctx).await;
        analysis.confidence = clamp_confidence(analysis.confidence);

        let record = json!({
            "root_cause": analysis.root_cause,
            "confidence": analysis.confidence,
            "explanation": analysis.explanation,
            "suggested_fixes": analysis.suggested_fixes,
            "method": analysis.method,
            "reasoner": self.reasoner.name(),
            "context": {
                "logs": ctx.logs.len(),
                "recent_changes": ctx.recent_changes.len(),
                "similar_incidents": ctx.similar_incidents.iter().map(|i| i.id).collect::<Vec<_>>(),
            },
            "analyzed_at": Utc::now().to_rfc3339(),
        });
        if !self
            .db
            .record_analysis(incident.id, &analysis.root_cause, analysis.confidence, &record)?
        {
            warn!(incident_id = incident.id, "incident changed during analysis, dropping result");
            return Ok(None);
        }

        self.queues.push(
            QueueName::Fix,
            &FixRequest {
                incident_id: incident.id,
                root_cause: analysis.root_cause.clone(),
                suggested_fixes: analysis.suggested_fixes.clone(),
                confidence: analysis.confidence,
                queued_at: Utc::now(),
            },
        )?;
        info!(
            incident_id = incident.id,
            confidence = analysis.confidence,
            method = %analysis.method,
            "root cause: {}",
            analysis.root_cause
        );
        let _ = self.event_tx.send(PipelineEvent::Analyzed {
            incident_id: incident.id,
            message: analysis.root_cause.clone(),
        });
        Ok(Some(analysis))
    }
}

#[async_trait]
impl Stage for Analyzer {
    fn name(&self) -> &'static str {
        "analyzer"
    }

    async fn step(&self) -> Result<()> {
        let msg: IncidentMessage = self.queues.recv(QueueName::Incident).await?;
        self.process(&msg).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_python_module() {
        assert_eq!(
            missing_python_module("ModuleNotFoundError: No module named 'requests'"),
            Some("requests".into())
        );
        assert_eq!(
            missing_python_module("No module named \"yaml.constructor\""),
            Some("yaml".into())
        );
        assert_eq!(missing_python_module("module has no attribute"), None);
    }

    #[test]
    fn extracts_node_module() {
        assert_eq!(
            missing_node_module("Error: Cannot find module 'express'"),
            Some("express".into())
        );
        assert_eq!(missing_node_module("Cannot find module './local'"), None);
    }

    #[test]
    fn root_cause_order_is_most_specific_first() {
        let ft = FailureType::Unknown;
        assert_eq!(
            pattern_root_cause("No module named 'requests'", ft),
            "missing dependency/resource"
        );
        assert_eq!(
            pattern_root_cause("open /data: permission denied", ft),
            "permission issue"
        );
        assert_eq!(
            pattern_root_cause("request timed out after 30s", ft),
            "network or service timeout"
        );
        assert_eq!(pattern_root_cause("pod OOMKilled", ft), "memory exhaustion");
        assert_eq!(
            pattern_root_cause("YAML parse error at line 3", ft),
            "config/code syntax error"
        );
        assert_eq!(
            pattern_root_cause("dial tcp: connection refused", ft),
            "connectivity issue"
        );
        assert_eq!(
            pattern_root_cause("exit code 2", FailureType::BuildFailure),
            "generic build failure issue"
        );
    }

    #[test]
    fn suggested_fixes_lead_with_package_and_cap_at_five() {
        let fixes = pattern_suggested_fixes(
            "ModuleNotFoundError: No module named 'requests'",
            FailureType::DependencyError,
        );
        assert_eq!(fixes.len(), 5);
        assert_eq!(fixes[0], "Add missing dependency 'requests' to requirements.txt");
        assert_eq!(fixes[1], "Update package registry configuration");

        let fixes = pattern_suggested_fixes("assert 1 == 2", FailureType::TestFailure);
        assert_eq!(fixes.len(), 4);
    }
}
