use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Incident Lifecycle ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Detected,
    Analyzing,
    Fixing,
    Resolved,
    Failed,
    RolledBack,
}

impl Default for IncidentStatus {
    fn default() -> Self {
        Self::Detected
    }
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detected => "detected",
            Self::Analyzing => "analyzing",
            Self::Fixing => "fixing",
            Self::Resolved => "resolved",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "detected" => Self::Detected,
            "analyzing" => Self::Analyzing,
            "fixing" => Self::Fixing,
            "resolved" => Self::Resolved,
            "failed" => Self::Failed,
            "rolled_back" => Self::RolledBack,
            _ => return None,
        })
    }

    /// Forward edges only. `rolled_back` is terminal.
    pub fn can_transition_to(&self, next: IncidentStatus) -> bool {
        use IncidentStatus::*;
        matches!(
            (self, next),
            (Detected, Analyzing)
                | (Analyzing, Fixing)
                | (Fixing, Resolved)
                | (Fixing, Failed)
                | (Fixing, RolledBack)
                | (Resolved, RolledBack)
                | (Failed, RolledBack)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for Severity {
    fn default() -> Self {
        Self::Medium
    }
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "low" => Self::Low,
            "medium" => Self::Medium,
            "high" => Self::High,
            "critical" => Self::Critical,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    BuildFailure,
    TestFailure,
    DeploymentFailure,
    DependencyError,
    SyntaxError,
    PermissionError,
    NetworkError,
    ResourceError,
    TimeoutError,
    ConfigurationError,
    SecurityError,
    Unknown,
}

impl Default for FailureType {
    fn default() -> Self {
        Self::Unknown
    }
}

impl FailureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BuildFailure => "build_failure",
            Self::TestFailure => "test_failure",
            Self::DeploymentFailure => "deployment_failure",
            Self::DependencyError => "dependency_error",
            Self::SyntaxError => "syntax_error",
            Self::PermissionError => "permission_error",
            Self::NetworkError => "network_error",
            Self::ResourceError => "resource_error",
            Self::TimeoutError => "timeout_error",
            Self::ConfigurationError => "configuration_error",
            Self::SecurityError => "security_error",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "build_failure" => Self::BuildFailure,
            "test_failure" => Self::TestFailure,
            "deployment_failure" => Self::DeploymentFailure,
            "dependency_error" => Self::DependencyError,
            "syntax_error" => Self::SyntaxError,
            "permission_error" => Self::PermissionError,
            "network_error" => Self::NetworkError,
            "resource_error" => Self::ResourceError,
            "timeout_error" => Self::TimeoutError,
            "configuration_error" => Self::ConfigurationError,
            "security_error" => Self::SecurityError,
            "unknown" => Self::Unknown,
            _ => return None,
        })
    }

    /// "build_failure" -> "Build Failure"
    pub fn label(&self) -> String {
        self.as_str()
            .split('_')
            .map(|w| {
                let mut c = w.chars();
                match c.next() {
                    Some(f) => f.to_uppercase().collect::<String>() + c.as_str(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// ── Pipeline Runs ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Github,
    Gitlab,
    Jenkins,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Gitlab => "gitlab",
            Self::Jenkins => "jenkins",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl Default for PipelineStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "success" => Self::Success,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }

    pub fn from_github(status: &str, conclusion: Option<&str>) -> Self {
        match (status, conclusion) {
            ("completed", Some("success")) => Self::Success,
            ("completed", Some("failure")) => Self::Failed,
            ("completed", Some("cancelled")) => Self::Cancelled,
            ("in_progress", _) => Self::Running,
            _ => Self::Pending,
        }
    }

    pub fn from_gitlab(status: &str) -> Self {
        match status {
            "success" => Self::Success,
            "failed" => Self::Failed,
            "canceled" => Self::Cancelled,
            "running" => Self::Running,
            _ => Self::Pending,
        }
    }

    /// Jenkins reports no result while a build is still running.
    pub fn from_jenkins(result: Option<&str>) -> Self {
        match result {
            Some("SUCCESS") => Self::Success,
            Some("FAILURE") | Some("UNSTABLE") => Self::Failed,
            Some("ABORTED") => Self::Cancelled,
            _ => Self::Running,
        }
    }
}

/// A normalized CI/CD execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: i64,
    pub platform: String,
    /// Platform-side identifier; unique together with `platform`.
    pub external_id: String,
    pub run_number: Option<i64>,
    pub status: PipelineStatus,
    pub repository: String,
    pub branch: String,
    pub commit_sha: String,
    pub commit_message: String,
    pub author: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub logs_url: String,
    pub metadata: Value,
    pub incident_id: Option<i64>,
}

// ── Incidents ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub status: IncidentStatus,
    pub severity: Severity,
    pub source_type: String,
    pub source_id: String,
    pub repository: String,
    pub branch: String,
    pub commit_sha: String,
    pub failure_type: FailureType,
    pub error_message: String,
    pub root_cause: Option<String>,
    /// Always within [0, 1].
    pub confidence_score: f64,
    pub analysis_data: Value,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to create an incident; the store assigns id and timestamps.
#[derive(Debug, Clone, Default)]
pub struct NewIncident {
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub source_type: String,
    pub source_id: String,
    pub repository: String,
    pub branch: String,
    pub commit_sha: String,
    pub failure_type: FailureType,
    pub error_message: String,
    pub confidence_score: f64,
    pub analysis_data: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncidentFilter {
    pub status: Option<IncidentStatus>,
    pub severity: Option<Severity>,
    pub repository: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

// ── Remediations ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    RolledBack,
}

impl Default for RemediationStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl RemediationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "in_progress" => Self::InProgress,
            "success" => Self::Success,
            "failed" => Self::Failed,
            "rolled_back" => Self::RolledBack,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixType {
    CodePatch,
    ConfigFix,
    DependencyUpdate,
    ScriptFix,
    YamlFix,
    DockerfileFix,
    TerraformFix,
    KubernetesFix,
    RestartService,
    ScaleResource,
}

/// Which external system applies a fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    VersionControl,
    Infrastructure,
}

impl FixType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CodePatch => "code_patch",
            Self::ConfigFix => "config_fix",
            Self::DependencyUpdate => "dependency_update",
            Self::ScriptFix => "script_fix",
            Self::YamlFix => "yaml_fix",
            Self::DockerfileFix => "dockerfile_fix",
            Self::TerraformFix => "terraform_fix",
            Self::KubernetesFix => "kubernetes_fix",
            Self::RestartService => "restart_service",
            Self::ScaleResource => "scale_resource",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "code_patch" => Self::CodePatch,
            "config_fix" => Self::ConfigFix,
            "dependency_update" => Self::DependencyUpdate,
            "script_fix" => Self::ScriptFix,
            "yaml_fix" => Self::YamlFix,
            "dockerfile_fix" => Self::DockerfileFix,
            "terraform_fix" => Self::TerraformFix,
            "kubernetes_fix" => Self::KubernetesFix,
            "restart_service" => Self::RestartService,
            "scale_resource" => Self::ScaleResource,
            _ => return None,
        })
    }

    pub fn channel(&self) -> ChannelKind {
        match self {
            Self::CodePatch
            | Self::ConfigFix
            | Self::DependencyUpdate
            | Self::ScriptFix
            | Self::YamlFix
            | Self::DockerfileFix
            | Self::TerraformFix
            | Self::KubernetesFix => ChannelKind::VersionControl,
            Self::RestartService | Self::ScaleResource => ChannelKind::Infrastructure,
        }
    }
}

/// Everything needed to undo one successful remediation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RollbackData {
    GitPr {
        repository: String,
        pr_number: i64,
        branch: String,
    },
    Infra {
        target: String,
        action: String,
        #[serde(default)]
        previous_state: Value,
    },
    None,
}

impl Default for RollbackData {
    fn default() -> Self {
        Self::None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Remediation {
    pub id: i64,
    pub incident_id: i64,
    pub fix_type: FixType,
    pub description: String,
    pub fix_content: String,
    pub target_files: Vec<String>,
    pub confidence: f64,
    pub retryable: bool,
    pub validation_steps: Vec<String>,
    pub status: RemediationStatus,
    pub error_message: Option<String>,
    pub rollback_data: RollbackData,
    pub details: Value,
    pub validation_passed: Option<bool>,
    pub validation_results: Option<Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A candidate fix produced by the fix generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedFix {
    pub fix_type: FixType,
    pub description: String,
    pub content: String,
    pub target_files: Vec<String>,
    pub confidence: f64,
    #[serde(default)]
    pub validation_steps: Vec<String>,
    /// Failure of this fix does not halt the rest of its batch.
    #[serde(default)]
    pub retryable: bool,
}

// ── Analysis ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootCauseAnalysis {
    pub root_cause: String,
    pub confidence: f64,
    pub explanation: String,
    pub suggested_fixes: Vec<String>,
    /// "pattern_analysis" or "llm_analysis".
    #[serde(default)]
    pub method: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub source_type: String,
    pub source_id: String,
    pub level: String,
    pub message: String,
    pub metadata: Value,
    pub logged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub repository: String,
    pub branch: String,
    pub sha: String,
    pub message: String,
    pub author: String,
    pub pushed_at: DateTime<Utc>,
}

// ── Queue Messages ───────────────────────────────────────────────────────

/// Emitted by the gateway when a pipeline transitions into failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSignal {
    pub source_type: String,
    pub source_id: String,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub commit_sha: String,
    pub message: String,
    #[serde(default = "default_level")]
    pub level: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Value,
}

fn default_level() -> String {
    "ERROR".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentMessage {
    pub incident_id: i64,
    pub failure_type: FailureType,
    pub severity: Severity,
    pub message: String,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixRequest {
    pub incident_id: i64,
    pub root_cause: String,
    pub suggested_fixes: Vec<String>,
    pub confidence: f64,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixSpec {
    pub remediation_id: i64,
    pub fix_type: FixType,
    pub description: String,
    pub content: String,
    pub target_files: Vec<String>,
    pub confidence: f64,
    #[serde(default)]
    pub retryable: bool,
}

impl From<&Remediation> for FixSpec {
    fn from(r: &Remediation) -> Self {
        Self {
            remediation_id: r.id,
            fix_type: r.fix_type,
            description: r.description.clone(),
            content: r.fix_content.clone(),
            target_files: r.target_files.clone(),
            confidence: r.confidence,
            retryable: r.retryable,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationBatch {
    pub incident_id: i64,
    pub fixes: Vec<FixSpec>,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub manual_trigger: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationJob {
    pub incident_id: i64,
    pub validation_type: String,
    pub queued_at: DateTime<Utc>,
}

// ── Pipeline Events ──────────────────────────────────────────────────────

/// Broadcast after each incident state change and operator action.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Detected {
        incident_id: i64,
        severity: Severity,
        message: String,
    },
    Analyzed {
        incident_id: i64,
        message: String,
    },
    FixesGenerated {
        incident_id: i64,
        count: usize,
    },
    Resolved {
        incident_id: i64,
        message: String,
    },
    Failed {
        incident_id: i64,
        message: String,
    },
    RolledBack {
        incident_id: i64,
        message: String,
    },
    EmergencyStop {
        active: bool,
        message: String,
    },
}

impl PipelineEvent {
    pub fn kind(&self) -> &str {
        match self {
            Self::Detected { .. } => "incident_detected",
            Self::Analyzed { .. } => "incident_analyzed",
            Self::FixesGenerated { .. } => "fixes_generated",
            Self::Resolved { .. } => "incident_resolved",
            Self::Failed { .. } => "incident_failed",
            Self::RolledBack { .. } => "incident_rolled_back",
            Self::EmergencyStop { .. } => "emergency_stop",
        }
    }

    pub fn incident_id(&self) -> Option<i64> {
        match self {
            Self::Detected { incident_id, .. }
            | Self::Analyzed { incident_id, .. }
            | Self::FixesGenerated { incident_id, .. }
            | Self::Resolved { incident_id, .. }
            | Self::Failed { incident_id, .. }
            | Self::RolledBack { incident_id, .. } => Some(*incident_id),
            Self::EmergencyStop { .. } => None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Detected { message, .. }
            | Self::Analyzed { message, .. }
            | Self::Resolved { message, .. }
            | Self::Failed { message, .. }
            | Self::RolledBack { message, .. }
            | Self::EmergencyStop { message, .. } => message.clone(),
            Self::FixesGenerated { count, .. } => format!("{count} fix(es) generated"),
        }
    }
}

/// Clamp any externally sourced confidence into [0, 1]; NaN becomes 0.
pub fn clamp_confidence(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_edge_skips_a_stage() {
        use IncidentStatus::*;
        assert!(!Detected.can_transition_to(Resolved));
        assert!(!Detected.can_transition_to(Fixing));
        assert!(!Analyzing.can_transition_to(Resolved));
        assert!(!Failed.can_transition_to(Fixing));
        assert!(!RolledBack.can_transition_to(Detected));
        assert!(Detected.can_transition_to(Analyzing));
        assert!(Fixing.can_transition_to(Failed));
        assert!(Resolved.can_transition_to(RolledBack));
    }

    #[test]
    fn github_status_vocabulary() {
        assert_eq!(
            PipelineStatus::from_github("completed", Some("failure")),
            PipelineStatus::Failed
        );
        assert_eq!(
            PipelineStatus::from_github("completed", Some("success")),
            PipelineStatus::Success
        );
        assert_eq!(
            PipelineStatus::from_github("in_progress", None),
            PipelineStatus::Running
        );
        assert_eq!(
            PipelineStatus::from_github("queued", None),
            PipelineStatus::Pending
        );
        assert_eq!(PipelineStatus::from_jenkins(None), PipelineStatus::Running);
        assert_eq!(
            PipelineStatus::from_jenkins(Some("UNSTABLE")),
            PipelineStatus::Failed
        );
        assert_eq!(PipelineStatus::from_gitlab("canceled"), PipelineStatus::Cancelled);
    }

    #[test]
    fn operational_fixes_route_to_infra() {
        assert_eq!(FixType::RestartService.channel(), ChannelKind::Infrastructure);
        assert_eq!(FixType::ScaleResource.channel(), ChannelKind::Infrastructure);
        assert_eq!(FixType::KubernetesFix.channel(), ChannelKind::VersionControl);
        assert_eq!(FixType::DependencyUpdate.channel(), ChannelKind::VersionControl);
    }

    #[test]
    fn rollback_data_is_tagged() {
        let rb = RollbackData::GitPr {
            repository: "acme/app".into(),
            pr_number: 7,
            branch: "ai-fix-123".into(),
        };
        let v = serde_json::to_value(&rb).unwrap();
        assert_eq!(v["kind"], "git_pr");
        assert_eq!(v["pr_number"], 7);
        let none: RollbackData = serde_json::from_str(r#"{"kind":"none"}"#).unwrap();
        assert_eq!(none, RollbackData::None);
    }

    #[test]
    fn clamp_handles_out_of_range() {
        assert_eq!(clamp_confidence(1.7), 1.0);
        assert_eq!(clamp_confidence(-0.2), 0.0);
        assert_eq!(clamp_confidence(f64::NAN), 0.0);
        assert_eq!(clamp_confidence(0.42), 0.42);
    }

    #[test]
    fn failure_type_label() {
        assert_eq!(FailureType::BuildFailure.label(), "Build Failure");
        assert_eq!(FailureType::Unknown.label(), "Unknown");
    }
}
