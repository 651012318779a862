use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::{
    channel::{ChannelOutcome, RemediationChannel},
    types::{FixSpec, FixType, Incident, RollbackData},
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Operational action decoded from a fix's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfraAction {
    pub action: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub params: Value,
}

impl InfraAction {
    /// Reads `{"action", "target", ...}` from the fix content, filling gaps from
    /// the fix type and the incident.
    pub fn from_fix(incident: &Incident, fix: &FixSpec) -> Self {
        let parsed: Value = serde_json::from_str(&fix.content).unwrap_or(Value::Null);
        let action = parsed["action"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| match fix.fix_type {
                FixType::ScaleResource => "scale".into(),
                _ => "restart".into(),
            });
        let target = parsed["target"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                incident
                    .repository
                    .rsplit('/')
                    .next()
                    .unwrap_or_default()
                    .to_string()
            });
        let mut params = parsed.clone();
        if let Some(obj) = params.as_object_mut() {
            obj.remove("action");
            obj.remove("target");
        }
        Self {
            action,
            target,
            params: if params.is_object() { params } else { json!({}) },
        }
    }

    /// The action that undoes this one given the state captured before it ran.
    /// Restarts have no inverse.
    pub fn inverse(action: &str, target: &str, previous_state: &Value) -> Option<Self> {
        match action {
            "scale" => Some(Self {
                action: "scale".into(),
                target: target.to_string(),
                params: previous_state.clone(),
            }),
            _ => None,
        }
    }
}

/// Calls the operations API at `INFRA_API_URL` for restart and scale fixes.
pub struct InfraChannel {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl InfraChannel {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.token.is_empty() {
            req
        } else {
            req.bearer_auth(&self.token)
        }
    }

    async fn post_action(&self, action: &InfraAction, incident_id: Option<i64>) -> Result<Value> {
        if self.base_url.is_empty() {
            bail!("INFRA_API_URL not configured");
        }
        let resp = self
            .authed(self.client.post(format!("{}/actions", self.base_url)))
            .json(&json!({
                "action": action.action,
                "target": action.target,
                "params": action.params,
                "incident_id": incident_id,
            }))
            .send()
            .await
            .context("infra action request")?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("infra action {} failed: {status} {text}", action.action);
        }
        Ok(resp.json().await.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl RemediationChannel for InfraChannel {
    fn name(&self) -> &str {
        "infra"
    }

    async fn apply(&self, incident: &Incident, fix: &FixSpec) -> Result<ChannelOutcome> {
        let action = InfraAction::from_fix(incident, fix);
        if action.target.is_empty() {
            bail!("infra fix has no target");
        }
        let resp = self.post_action(&action, Some(incident.id)).await?;
        info!(
            incident_id = incident.id,
            action = %action.action,
            target = %action.target,
            "infra action accepted"
        );
        Ok(ChannelOutcome {
            message: format!("{} {}", action.action, action.target),
            details: json!({ "request": action, "response": resp }),
            rollback: RollbackData::Infra {
                target: action.target.clone(),
                action: action.action.clone(),
                previous_state: resp.get("previous_state").cloned().unwrap_or(Value::Null),
            },
        })
    }

    async fn rollback(&self, data: &RollbackData) -> Result<()> {
        let RollbackData::Infra {
            target,
            action,
            previous_state,
        } = data
        else {
            bail!("infra channel cannot roll back {data:?}");
        };
        match InfraAction::inverse(action, target, previous_state) {
            Some(inv) if !previous_state.is_null() => {
                self.post_action(&inv, None).await?;
                info!(target = %target, action = %action, "infra action reverted");
            }
            _ => info!(target = %target, action = %action, "no inverse action, nothing to revert"),
        }
        Ok(())
    }

    async fn verify(&self, data: &RollbackData) -> Result<bool> {
        let RollbackData::Infra { target, .. } = data else {
            return Ok(false);
        };
        if self.base_url.is_empty() {
            bail!("INFRA_API_URL not configured");
        }
        let resp = self
            .authed(
                self.client
                    .get(format!("{}/targets/{}/status", self.base_url, target)),
            )
            .send()
            .await
            .context("infra status request")?;
        if !resp.status().is_success() {
            return Ok(false);
        }
        let v: Value = resp.json().await.unwrap_or(Value::Null);
        Ok(v["healthy"].as_bool().unwrap_or(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FailureType, IncidentStatus, Severity};
    use chrono::Utc;

    fn incident() -> Incident {
        Incident {
            id: 9,
            title: "Deployment Failure in deploy-7".into(),
            description: String::new(),
            status: IncidentStatus::Fixing,
            severity: Severity::High,
            source_type: "github".into(),
            source_id: "deploy-7".into(),
            repository: "acme/payments".into(),
            branch: "main".into(),
            commit_sha: String::new(),
            failure_type: FailureType::DeploymentFailure,
            error_message: "CrashLoopBackOff".into(),
            root_cause: None,
            confidence_score: 0.6,
            analysis_data: json!({}),
            detected_at: Utc::now(),
            resolved_at: None,
            updated_at: Utc::now(),
        }
    }

    fn spec(fix_type: FixType, content: &str) -> FixSpec {
        FixSpec {
            remediation_id: 1,
            fix_type,
            description: String::new(),
            content: content.into(),
            target_files: vec![],
            confidence: 0.7,
            retryable: true,
        }
    }

    #[test]
    fn action_read_from_content() {
        let a = InfraAction::from_fix(
            &incident(),
            &spec(FixType::ScaleResource, r#"{"action":"scale","target":"api","replicas":3}"#),
        );
        assert_eq!(a.action, "scale");
        assert_eq!(a.target, "api");
        assert_eq!(a.params, json!({ "replicas": 3 }));
    }

    #[test]
    fn action_defaults_from_fix_type_and_repository() {
        let a = InfraAction::from_fix(&incident(), &spec(FixType::RestartService, "not json"));
        assert_eq!(a.action, "restart");
        assert_eq!(a.target, "payments");
        assert_eq!(a.params, json!({}));
    }

    #[test]
    fn only_scale_has_an_inverse() {
        let prev = json!({ "replicas": 2 });
        let inv = InfraAction::inverse("scale", "api", &prev).unwrap();
        assert_eq!(inv.params, prev);
        assert!(InfraAction::inverse("restart", "api", &prev).is_none());
    }
}
