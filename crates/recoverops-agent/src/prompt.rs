use recoverops_core::{
    llm::CompletionParams,
    reasoner::AnalysisContext,
    types::{clamp_confidence, FixRequest, FixType, GeneratedFix, Incident, RootCauseAnalysis},
};
use serde::Deserialize;
use serde_json::{json, Value};

pub const ANALYSIS_SYSTEM: &str =
    "You are an expert DevOps engineer specializing in CI/CD failure analysis.";
pub const FIX_SYSTEM: &str =
    "You are an expert DevOps engineer who generates precise fixes for CI/CD failures.";

pub const ANALYSIS_PARAMS: CompletionParams = CompletionParams {
    temperature: 0.3,
    max_tokens: 1000,
};
pub const FIX_PARAMS: CompletionParams = CompletionParams {
    temperature: 0.2,
    max_tokens: 1500,
};

const PROMPT_LOG_LIMIT: usize = 5;
const FALLBACK_CONFIDENCE: f64 = 0.7;

fn pretty(v: &Value) -> String {
    serde_json::to_string_pretty(v).unwrap_or_default()
}

// ── Prompts ───────────────────────────────────────────────────────────────

pub fn build_analysis_prompt(incident: &Incident, ctx: &AnalysisContext) -> String {
    let logs: Vec<Value> = ctx
        .logs
        .iter()
        .take(PROMPT_LOG_LIMIT)
        .map(|l| json!({ "level": l.level, "message": l.message, "at": l.logged_at.to_rfc3339() }))
        .collect();
    let changes: Vec<Value> = ctx
        .recent_changes
        .iter()
        .map(|c| json!({ "sha": c.sha, "author": c.author, "message": c.message }))
        .collect();
    let similar: Vec<Value> = ctx
        .similar_incidents
        .iter()
        .map(|i| json!({ "title": i.title, "error": i.error_message, "root_cause": i.root_cause }))
        .collect();

    format!(
        r#"Analyze this CI/CD failure and provide a detailed root cause analysis.

INCIDENT DETAILS:
- Title: {title}
- Type: {failure_type}
- Error: {error}
- Repository: {repository}
- Branch: {branch}

CONTEXT:
- Recent logs: {logs}
- Recent changes: {changes}
- Similar resolved incidents: {similar}

Respond with JSON only:
{{
  "root_cause": "specific root cause",
  "confidence": 0.85,
  "explanation": "why this failure occurred",
  "suggested_fixes": ["specific fix 1", "specific fix 2", "specific fix 3"]
}}"#,
        title = incident.title,
        failure_type = incident.failure_type.as_str(),
        error = incident.error_message,
        repository = incident.repository,
        branch = incident.branch,
        logs = pretty(&Value::Array(logs)),
        changes = pretty(&Value::Array(changes)),
        similar = pretty(&Value::Array(similar)),
    )
}

pub fn build_fix_prompt(incident: &Incident, request: &FixRequest) -> String {
    format!(
        r#"Generate concrete fixes for this CI/CD failure.

INCIDENT:
- Type: {failure_type}
- Error: {error}
- Root Cause: {root_cause}
- Repository: {repository}
- Branch: {branch}

Suggested fixes: {suggested}

Allowed fix_type values: code_patch, config_fix, dependency_update, script_fix, yaml_fix,
dockerfile_fix, terraform_fix, kubernetes_fix, restart_service, scale_resource.
For dependency_update, content lists only the packages to add. For restart_service and
scale_resource, content is a JSON object with "action", "target" and any parameters.
Otherwise content is the complete new file content.

Respond with a JSON array only:
[
  {{
    "fix_type": "dependency_update",
    "description": "Brief description of the fix",
    "content": "exact file content",
    "target_files": ["requirements.txt"],
    "validation_steps": ["step 1", "step 2"],
    "confidence": 0.85
  }}
]"#,
        failure_type = incident.failure_type.as_str(),
        error = incident.error_message,
        root_cause = request.root_cause,
        repository = incident.repository,
        branch = incident.branch,
        suggested = pretty(&json!(request.suggested_fixes)),
    )
}

// ── Reply parsing ─────────────────────────────────────────────────────────

/// Pull the JSON document out of a model reply: the first fenced block if
/// there is one, else the span from the first `{` or `[` to its last closer.
pub fn extract_json(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            let inner = body[..end].trim();
            if !inner.is_empty() {
                return Some(inner);
            }
        }
    }
    let open = text.find(['{', '['])?;
    let closer = if text[open..].starts_with('{') { '}' } else { ']' };
    let close = text.rfind(closer)?;
    (close > open).then(|| &text[open..=close])
}

#[derive(Deserialize)]
struct AnalysisReply {
    #[serde(default)]
    root_cause: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    explanation: String,
    #[serde(default)]
    suggested_fixes: Vec<String>,
}

/// Non-JSON replies keep the text as the explanation.
pub fn parse_analysis(text: &str) -> RootCauseAnalysis {
    let parsed = extract_json(text).and_then(|j| serde_json::from_str::<AnalysisReply>(j).ok());
    match parsed {
        Some(r) if !r.root_cause.trim().is_empty() => RootCauseAnalysis {
            root_cause: r.root_cause.trim().to_string(),
            confidence: clamp_confidence(r.confidence.unwrap_or(FALLBACK_CONFIDENCE)),
            explanation: r.explanation,
            suggested_fixes: r.suggested_fixes,
            method: "llm_analysis".into(),
        },
        _ => RootCauseAnalysis {
            root_cause: "Analysis completed".into(),
            confidence: FALLBACK_CONFIDENCE,
            explanation: text.trim().to_string(),
            suggested_fixes: vec!["Review the analysis above".into()],
            method: "llm_analysis".into(),
        },
    }
}

#[derive(Deserialize)]
struct FixReply {
    #[serde(default)]
    fix_type: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    target_files: Vec<String>,
    #[serde(default)]
    validation_steps: Vec<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

impl FixReply {
    fn into_fix(self) -> Option<GeneratedFix> {
        let content = match self.content {
            Value::String(s) => s,
            Value::Null => return None,
            other => other.to_string(),
        };
        if content.trim().is_empty() {
            return None;
        }
        let fix_type = FixType::parse(self.fix_type.trim()).unwrap_or(FixType::CodePatch);
        Some(GeneratedFix {
            fix_type,
            description: if self.description.is_empty() {
                "Generated fix".into()
            } else {
                self.description
            },
            content,
            target_files: self.target_files,
            confidence: clamp_confidence(self.confidence.unwrap_or(FALLBACK_CONFIDENCE)),
            validation_steps: self.validation_steps,
            retryable: matches!(fix_type, FixType::RestartService | FixType::ScaleResource),
        })
    }
}

/// Accepts a JSON array of fixes, `{"fixes": [...]}` or a single fix object.
/// `None` when nothing usable came back.
pub fn parse_fixes(text: &str) -> Option<Vec<GeneratedFix>> {
    let value: Value = serde_json::from_str(extract_json(text)?).ok()?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("fixes") {
            Some(Value::Array(items)) => items,
            Some(_) => return None,
            None => vec![Value::Object(map)],
        },
        _ => return None,
    };
    let fixes: Vec<GeneratedFix> = items
        .into_iter()
        .filter_map(|v| serde_json::from_value::<FixReply>(v).ok())
        .filter_map(FixReply::into_fix)
        .collect();
    (!fixes.is_empty()).then_some(fixes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_json() {
        let text = "Here you go:\n```json\n{\"a\": 1}\n```\nthanks";
        assert_eq!(extract_json(text), Some("{\"a\": 1}"));
    }

    #[test]
    fn extracts_bare_object_and_array() {
        assert_eq!(extract_json("sure {\"a\": {\"b\": 2}} done"), Some("{\"a\": {\"b\": 2}}"));
        assert_eq!(extract_json("[1, 2]"), Some("[1, 2]"));
        assert_eq!(extract_json("no json here"), None);
    }

    #[test]
    fn plain_text_analysis_keeps_explanation() {
        let a = parse_analysis("The lockfile is stale.");
        assert_eq!(a.root_cause, "Analysis completed");
        assert_eq!(a.confidence, 0.7);
        assert_eq!(a.explanation, "The lockfile is stale.");
    }

    #[test]
    fn analysis_confidence_is_clamped() {
        let a = parse_analysis(r#"{"root_cause": "stale cache", "confidence": 3}"#);
        assert_eq!(a.root_cause, "stale cache");
        assert_eq!(a.confidence, 1.0);
        assert_eq!(a.method, "llm_analysis");
    }

    #[test]
    fn fixes_accept_wrapped_and_single_forms() {
        let wrapped = r#"{"fixes": [{"fix_type": "yaml_fix", "content": "a: 1", "target_files": ["ci.yml"]}]}"#;
        let fixes = parse_fixes(wrapped).unwrap();
        assert_eq!(fixes[0].fix_type, FixType::YamlFix);
        assert_eq!(fixes[0].description, "Generated fix");

        let single = r#"{"fix_type": "restart_service", "content": {"action": "restart", "target": "api"}}"#;
        let fixes = parse_fixes(single).unwrap();
        assert!(fixes[0].retryable);
        let content: Value = serde_json::from_str(&fixes[0].content).unwrap();
        assert_eq!(content["target"], "api");
    }

    #[test]
    fn empty_content_and_garbage_yield_none() {
        assert!(parse_fixes(r#"[{"fix_type": "code_patch", "content": ""}]"#).is_none());
        assert!(parse_fixes("I could not find a fix").is_none());
    }
}
