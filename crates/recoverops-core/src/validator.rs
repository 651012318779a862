use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::{
    channel::Channels,
    db::Db,
    pipeline::Stage,
    queue::{QueueName, Queues},
    types::{RemediationStatus, ValidationJob},
};

const VERIFY_TIMEOUT: Duration = Duration::from_secs(60);

/// Post-remediation checks: confirms each applied fix is still in place.
pub struct Validator {
    db: Arc<Db>,
    queues: Arc<Queues>,
    channels: Channels,
}

impl Validator {
    pub fn new(db: Arc<Db>, queues: Arc<Queues>, channels: Channels) -> Self {
        Self {
            db,
            queues,
            channels,
        }
    }

    /// Returns (checked, passed).
    pub async fn process(&self, job: &ValidationJob) -> Result<(usize, usize)> {
        let applied = self
            .db
            .list_remediations_with_status(job.incident_id, RemediationStatus::Success)?;
        let mut passed = 0;
        for r in &applied {
            let (ok, detail) = match self.channels.for_rollback(&r.rollback_data) {
                None => (true, json!("no external change to verify")),
                Some(ch) => match tokio::time::timeout(VERIFY_TIMEOUT, ch.verify(&r.rollback_data))
                    .await
                {
                    Ok(Ok(ok)) => (ok, json!(if ok { "change in place" } else { "change missing" })),
                    Ok(Err(e)) => (false, json!(format!("verification error: {e:#}"))),
                    Err(_) => (false, json!("verification timed out")),
                },
            };
            self.db.record_validation(
                r.id,
                ok,
                &json!({
                    "validation_type": job.validation_type,
                    "result": detail,
                    "checked_at": Utc::now().to_rfc3339(),
                }),
            )?;
            if ok {
                passed += 1;
            } else {
                warn!(incident_id = job.incident_id, remediation_id = r.id, "validation failed");
            }
        }
        info!(
            incident_id = job.incident_id,
            checked = applied.len(),
            passed,
            "validation complete"
        );
        Ok((applied.len(), passed))
    }
}

#[async_trait]
impl Stage for Validator {
    fn name(&self) -> &'static str {
        "validator"
    }

    async fn step(&self) -> Result<()> {
        let job: ValidationJob = self.queues.recv(QueueName::Validation).await?;
        self.process(&job).await?;
        Ok(())
    }
}
