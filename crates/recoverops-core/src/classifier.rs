use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use regex::{Regex, RegexBuilder};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::info;

use crate::{
    db::Db,
    pipeline::Stage,
    queue::{QueueName, Queues},
    types::{FailureType, IncidentMessage, NewIncident, PipelineEvent, RawSignal, Severity},
};

/// One pattern rule. Rules are evaluated in declaration order.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub pattern: Regex,
    pub failure_type: FailureType,
    pub severity: Severity,
    pub confidence: f64,
    pub description: String,
}

impl Rule {
    pub fn new(
        name: &str,
        pattern: &str,
        failure_type: FailureType,
        severity: Severity,
        confidence: f64,
        description: &str,
    ) -> Result<Self> {
        let pattern = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .with_context(|| format!("compile rule {name}"))?;
        Ok(Self {
            name: name.into(),
            pattern,
            failure_type,
            severity,
            confidence,
            description: description.into(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub failure_type: FailureType,
    pub severity: Severity,
    pub confidence: f64,
    /// Rule or heuristic that produced this result.
    pub pattern_name: String,
    pub description: String,
    pub method: &'static str,
}

pub fn builtin_rules() -> Result<Vec<Rule>> {
    use FailureType::*;
    use Severity::*;
    let table: &[(&str, &str, FailureType, Severity, f64, &str)] = &[
        (
            "compilation_error",
            r"(compilation failed|compile error|syntax error|cannot find symbol)",
            BuildFailure,
            High,
            0.9,
            "Code compilation failure",
        ),
        (
            "dependency_missing",
            r"(module not found|package not found|dependency.*not found|could not resolve|modulenotfounderror|no module named|cannot find module)",
            DependencyError,
            High,
            0.85,
            "Missing dependency or package",
        ),
        (
            "test_assertion_failure",
            r"(assertion.*failed|test.*failed|expected.*but got|AssertionError)",
            TestFailure,
            Medium,
            0.8,
            "Test assertion failure",
        ),
        (
            "test_timeout",
            r"(test.*timeout|test.*timed out|timeout.*test)",
            TimeoutError,
            Medium,
            0.85,
            "Test execution timeout",
        ),
        (
            "kubernetes_deployment_failed",
            r"(deployment.*failed|pod.*failed|container.*failed|ImagePullBackOff|CrashLoopBackOff)",
            DeploymentFailure,
            Critical,
            0.9,
            "Kubernetes deployment failure",
        ),
        (
            "docker_build_failed",
            r"(docker build.*failed|dockerfile.*error|image.*build.*failed)",
            BuildFailure,
            High,
            0.85,
            "Docker image build failure",
        ),
        (
            "yaml_syntax_error",
            r"(yaml.*error|yml.*error|invalid.*yaml|malformed.*yaml)",
            SyntaxError,
            Medium,
            0.9,
            "YAML configuration syntax error",
        ),
        (
            "json_syntax_error",
            r"(json.*error|invalid.*json|malformed.*json|unexpected token)",
            SyntaxError,
            Medium,
            0.9,
            "JSON configuration syntax error",
        ),
        (
            "permission_denied",
            r"(permission denied|access denied|forbidden|unauthorized|\b403\b)",
            PermissionError,
            High,
            0.85,
            "Permission or access denied",
        ),
        (
            "aws_credentials_error",
            r"(aws.*credentials|access key|secret key|token.*expired|InvalidAccessKeyId)",
            SecurityError,
            Critical,
            0.9,
            "Cloud credentials or authentication error",
        ),
        (
            "connection_timeout",
            r"(connection.*timeout|network.*timeout|timeout.*connection|timed out)",
            NetworkError,
            Medium,
            0.8,
            "Network connection timeout",
        ),
        (
            "dns_resolution_failed",
            r"(dns.*resolution.*failed|name.*not.*resolved|host.*not.*found)",
            NetworkError,
            Medium,
            0.85,
            "DNS resolution failure",
        ),
        (
            "out_of_memory",
            r"(out of memory|\boom\b|oomkilled|memory.*exceeded|killed.*memory)",
            ResourceError,
            High,
            0.9,
            "Out of memory error",
        ),
        (
            "disk_space_full",
            r"(no space left|disk.*full|storage.*full|quota.*exceeded)",
            ResourceError,
            High,
            0.9,
            "Disk space exhausted",
        ),
    ];
    table
        .iter()
        .map(|(name, pattern, ft, sev, conf, desc)| Rule::new(name, pattern, *ft, *sev, *conf, desc))
        .collect()
}

const BUILD_WORDS: &[&str] = &[
    "build", "compile", "maven", "gradle", "npm", "cargo", "pipeline", "workflow",
];
const TEST_WORDS: &[&str] = &["test", "spec", "junit", "pytest", "mocha"];
const DEPLOY_WORDS: &[&str] = &["deploy", "kubernetes", "docker", "container"];
const FAILURE_WORDS: &[&str] = &[
    "failed", "error", "exception", "timeout", "denied", "refused", "crash", "killed", "abort",
    "panic", "fatal", "critical",
];

fn keyword_classification(message: &str, level: &str) -> Classification {
    let lower = message.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));
    let (failure_type, severity, confidence, name, description) = if has(BUILD_WORDS) {
        (
            FailureType::BuildFailure,
            Severity::High,
            0.7,
            "keyword_build_failure",
            "Build process failure detected",
        )
    } else if has(TEST_WORDS) {
        (
            FailureType::TestFailure,
            Severity::Medium,
            0.7,
            "keyword_test_failure",
            "Test execution failure detected",
        )
    } else if has(DEPLOY_WORDS) {
        (
            FailureType::DeploymentFailure,
            Severity::High,
            0.7,
            "keyword_deployment_failure",
            "Deployment failure detected",
        )
    } else if has(FAILURE_WORDS) || matches!(level, "ERROR" | "FATAL") {
        (
            FailureType::Unknown,
            Severity::Medium,
            0.5,
            "keyword_unknown_error",
            "Unknown error detected",
        )
    } else {
        return Classification {
            failure_type: FailureType::Unknown,
            severity: Severity::Low,
            confidence: 0.3,
            pattern_name: "unclassified".into(),
            description: "Unclassified failure signal".into(),
            method: "fallback",
        };
    };
    Classification {
        failure_type,
        severity,
        confidence,
        pattern_name: name.into(),
        description: description.into(),
        method: "keyword_heuristic",
    }
}

/// Consumes raw signals and turns them into deduplicated incidents.
pub struct Classifier {
    db: Arc<Db>,
    queues: Arc<Queues>,
    rules: Vec<Rule>,
    dedup_window_s: i64,
    event_tx: broadcast::Sender<PipelineEvent>,
}

impl Classifier {
    pub fn new(
        db: Arc<Db>,
        queues: Arc<Queues>,
        event_tx: broadcast::Sender<PipelineEvent>,
        dedup_window_s: i64,
    ) -> Result<Self> {
        Ok(Self {
            db,
            queues,
            rules: builtin_rules()?,
            dedup_window_s,
            event_tx,
        })
    }

    pub fn with_rules(mut self, rules: Vec<Rule>) -> Self {
        self.rules = rules;
        self
    }

    /// Highest-confidence matching rule wins; on equal confidence the first declared rule
    /// is kept. Falls back to keyword heuristics and never returns "no result".
    pub fn classify(&self, message: &str, level: &str) -> Classification {
        let mut best: Option<&Rule> = None;
        for rule in &self.rules {
            if !rule.pattern.is_match(message) {
                continue;
            }
            if best.map_or(true, |b| rule.confidence > b.confidence) {
                best = Some(rule);
            }
        }
        match best {
            Some(rule) => Classification {
                failure_type: rule.failure_type,
                severity: rule.severity,
                confidence: rule.confidence,
                pattern_name: rule.name.clone(),
                description: rule.description.clone(),
                method: "pattern_matching",
            },
            None => keyword_classification(message, level),
        }
    }

    /// Returns the new incident id, or `None` when suppressed as a duplicate.
    pub fn process(&self, signal: &RawSignal) -> Result<Option<i64>> {
        self.db.insert_log_entry(
            &signal.source_type,
            &signal.source_id,
            &signal.level,
            &signal.message,
            &signal.metadata,
        )?;

        let c = self.classify(&signal.message, &signal.level);
        if let Some(existing) =
            self.db
                .find_active_duplicate(c.failure_type, &signal.source_id, self.dedup_window_s)?
        {
            info!(
                incident_id = existing,
                source_id = %signal.source_id,
                "similar incident already exists, suppressing duplicate"
            );
            return Ok(None);
        }

        let source = if signal.source_id.is_empty() {
            "Unknown"
        } else {
            signal.source_id.as_str()
        };
        let incident = NewIncident {
            title: format!("{} in {}", c.failure_type.label(), source),
            description: c.description.clone(),
            severity: c.severity,
            source_type: signal.source_type.clone(),
            source_id: signal.source_id.clone(),
            repository: signal.repository.clone(),
            branch: signal.branch.clone(),
            commit_sha: signal.commit_sha.clone(),
            failure_type: c.failure_type,
            error_message: signal.message.clone(),
            confidence_score: c.confidence,
            analysis_data: json!({
                "pattern_name": c.pattern_name,
                "detection_method": c.method,
                "log_data": signal,
            }),
        };
        let id = self.db.insert_incident(&incident)?;
        if !signal.source_type.is_empty() {
            self.db
                .link_pipeline_run(&signal.source_type, &signal.source_id, id)?;
        }

        self.queues.push(
            QueueName::Incident,
            &IncidentMessage {
                incident_id: id,
                failure_type: c.failure_type,
                severity: c.severity,
                message: signal.message.clone(),
                queued_at: Utc::now(),
            },
        )?;
        info!(
            incident_id = id,
            failure_type = c.failure_type.as_str(),
            confidence = c.confidence,
            "created incident: {}",
            incident.title
        );
        let _ = self.event_tx.send(PipelineEvent::Detected {
            incident_id: id,
            severity: c.severity,
            message: incident.title,
        });
        Ok(Some(id))
    }
}

#[async_trait]
impl Stage for Classifier {
    fn name(&self) -> &'static str {
        "classifier"
    }

    async fn step(&self) -> Result<()> {
        let signal: RawSignal = self.queues.recv(QueueName::RawSignal).await?;
        self.process(&signal)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_rules_compile() {
        let rules = builtin_rules().expect("rules");
        assert_eq!(rules.len(), 14);
        assert_eq!(rules[0].name, "compilation_error");
    }

    #[test]
    fn keyword_fallback_tiers() {
        let c = keyword_classification("Pipeline failed: workflow 'CI'", "ERROR");
        assert_eq!(c.failure_type, FailureType::BuildFailure);
        assert_eq!(c.confidence, 0.7);

        let c = keyword_classification("pytest exited 1", "ERROR");
        assert_eq!(c.failure_type, FailureType::TestFailure);

        let c = keyword_classification("kubernetes rollout stuck", "WARN");
        assert_eq!(c.failure_type, FailureType::DeploymentFailure);

        let c = keyword_classification("segfault: fatal", "INFO");
        assert_eq!((c.failure_type, c.confidence), (FailureType::Unknown, 0.5));

        let c = keyword_classification("something odd happened", "INFO");
        assert_eq!((c.failure_type, c.confidence), (FailureType::Unknown, 0.3));
    }

    #[test]
    fn oom_does_not_match_inside_words() {
        let rules = builtin_rules().expect("rules");
        let oom = rules.iter().find(|r| r.name == "out_of_memory").expect("rule");
        assert!(oom.pattern.is_match("container OOMKilled"));
        assert!(oom.pattern.is_match("process died: OOM"));
        assert!(!oom.pattern.is_match("no room on the bus"));
    }
}
