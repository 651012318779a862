use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::types::{PipelineEvent, Severity};

fn severity_colour(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "#d00000",
        Severity::High => "#ff6600",
        Severity::Medium => "#ffcc00",
        Severity::Low => "#36a64f",
    }
}

/// Slack message for an event, or `None` for events operators are not paged about.
pub fn slack_payload(event: &PipelineEvent) -> Option<Value> {
    let (title, colour) = match event {
        PipelineEvent::Detected { severity, .. } => (
            format!("Incident detected ({})", severity.as_str()),
            severity_colour(*severity),
        ),
        PipelineEvent::Resolved { .. } => ("Incident resolved".to_string(), "#36a64f"),
        PipelineEvent::Failed { .. } => ("Remediation failed".to_string(), "#d00000"),
        PipelineEvent::RolledBack { .. } => ("Incident rolled back".to_string(), "#439fe0"),
        PipelineEvent::EmergencyStop { active: true, .. } => {
            ("Emergency stop activated".to_string(), "#d00000")
        }
        PipelineEvent::EmergencyStop { active: false, .. } => {
            ("Emergency stop cleared".to_string(), "#36a64f")
        }
        PipelineEvent::Analyzed { .. } | PipelineEvent::FixesGenerated { .. } => return None,
    };
    let title = match event.incident_id() {
        Some(id) => format!("{title}: #{id}"),
        None => title,
    };
    Some(json!({
        "text": title,
        "attachments": [{
            "color": colour,
            "text": event.message(),
            "footer": "recoverops",
        }],
    }))
}

/// Posts pipeline events to a Slack incoming webhook.
pub struct SlackNotifier {
    client: Client,
    webhook_url: String,
}

impl SlackNotifier {
    pub fn new(webhook_url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(10)).build()?,
            webhook_url: webhook_url.into(),
        })
    }

    pub async fn send(&self, payload: &Value) -> Result<()> {
        let resp = self
            .client
            .post(&self.webhook_url)
            .json(payload)
            .send()
            .await
            .context("slack webhook request")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("slack webhook returned {status}: {text}");
        }
        Ok(())
    }

    /// Forwards events until the channel closes. Delivery failures are logged only.
    pub async fn run(self, mut rx: broadcast::Receiver<PipelineEvent>) {
        info!("slack notifier started");
        loop {
            match rx.recv().await {
                Ok(evt) => {
                    let Some(payload) = slack_payload(&evt) else {
                        continue;
                    };
                    if let Err(e) = self.send(&payload).await {
                        warn!(event = evt.kind(), "slack notification failed: {e:#}");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "slack notifier lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
