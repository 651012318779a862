use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Notify};
use tracing::{error, info, warn};

use crate::{
    channel::Channels,
    config::Config,
    db::Db,
    queue::{QueueName, Queues},
    types::{
        FixRequest, FixSpec, Incident, IncidentStatus, PipelineEvent, RemediationBatch,
        RemediationStatus, ValidationJob,
    },
};

/// Failed fixes at or above this confidence may let the batch continue, if retryable.
const HALT_CONFIDENCE: f64 = 0.8;
const LOOP_BACKOFF: Duration = Duration::from_secs(20);
const IDLE_WAIT: Duration = Duration::from_secs(5);
pub const CANCELLED_ERROR: &str = "cancelled by emergency stop";

/// Operator-facing failures, mapped to HTTP statuses by the server.
#[derive(Debug)]
pub enum ExecutorError {
    NotFound(i64),
    Conflict(String),
    InvalidState(String),
    Internal(anyhow::Error),
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "incident {id} not found"),
            Self::Conflict(msg) | Self::InvalidState(msg) => f.write_str(msg),
            Self::Internal(e) => write!(f, "{e:#}"),
        }
    }
}

impl std::error::Error for ExecutorError {}

impl From<anyhow::Error> for ExecutorError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub max_concurrent: usize,
    pub remediation_timeout: Duration,
    pub rollback_timeout: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            remediation_timeout: Duration::from_secs(300),
            rollback_timeout: Duration::from_secs(600),
        }
    }
}

impl ExecutorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent: config.max_concurrent_remediations.max(1) as usize,
            remediation_timeout: Duration::from_secs(config.remediation_timeout_s),
            rollback_timeout: Duration::from_secs(config.rollback_timeout_s),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InFlight {
    pub incident_id: i64,
    pub started_at: DateTime<Utc>,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    /// The batch did not run; the incident was not touched.
    Skipped(&'static str),
    Completed {
        status: IncidentStatus,
        executed: Vec<i64>,
        succeeded: usize,
        cancelled: bool,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackReport {
    pub incident_id: i64,
    pub status: IncidentStatus,
    pub rolled_back: Vec<i64>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ManualTrigger {
    Requeued { count: usize },
    Regenerating,
}

/// What happened to a batch handed over by the dequeue loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Started,
    Requeued,
    Duplicate,
}

enum Claim {
    Claimed,
    AtCapacity,
    AlreadyInFlight,
}

/// Applies fix batches through the remediation channels under a global
/// concurrency cap, with an operator kill switch and explicit rollback.
pub struct Executor {
    db: Arc<Db>,
    queues: Arc<Queues>,
    channels: Channels,
    event_tx: broadcast::Sender<PipelineEvent>,
    settings: ExecutorSettings,
    in_flight: Mutex<HashMap<i64, InFlight>>,
    emergency_stop: AtomicBool,
    auto_enabled: Arc<AtomicBool>,
    slot_freed: Notify,
    resumed: Notify,
}

impl Executor {
    pub fn new(
        db: Arc<Db>,
        queues: Arc<Queues>,
        channels: Channels,
        event_tx: broadcast::Sender<PipelineEvent>,
        settings: ExecutorSettings,
        auto_enabled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            db,
            queues,
            channels,
            event_tx,
            settings,
            in_flight: Mutex::new(HashMap::new()),
            emergency_stop: AtomicBool::new(false),
            auto_enabled,
            slot_freed: Notify::new(),
            resumed: Notify::new(),
        }
    }

    // ── Flags and status ──────────────────────────────────────────────────

    pub fn emergency_stopped(&self) -> bool {
        self.emergency_stop.load(Ordering::SeqCst)
    }

    /// Raising the stop marks every in-flight batch cancelled; they finish the
    /// fix they are on and apply nothing further.
    pub fn set_emergency_stop(&self, active: bool) {
        let was = self.emergency_stop.swap(active, Ordering::SeqCst);
        if active {
            let mut map = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            for entry in map.values_mut() {
                entry.cancelled = true;
            }
        } else {
            self.resumed.notify_one();
        }
        if was == active {
            return;
        }
        let message = if active {
            warn!("emergency stop activated, remediation halted");
            "Emergency stop activated - all remediation halted"
        } else {
            info!("emergency stop cleared, remediation resumed");
            "Emergency stop deactivated - remediation resumed"
        };
        let _ = self.event_tx.send(PipelineEvent::EmergencyStop {
            active,
            message: message.into(),
        });
    }

    pub fn auto_enabled(&self) -> bool {
        self.auto_enabled.load(Ordering::SeqCst)
    }

    pub fn set_auto_enabled(&self, enabled: bool) {
        self.auto_enabled.store(enabled, Ordering::SeqCst);
        info!(enabled, "auto remediation toggled");
    }

    pub fn max_concurrent(&self) -> usize {
        self.settings.max_concurrent
    }

    pub fn in_flight(&self) -> Vec<InFlight> {
        let map = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<InFlight> = map.values().cloned().collect();
        out.sort_by_key(|e| e.incident_id);
        out
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn is_in_flight(&self, incident_id: i64) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&incident_id)
    }

    fn claim(&self, incident_id: i64) -> Claim {
        let mut map = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(&incident_id) {
            return Claim::AlreadyInFlight;
        }
        if map.len() >= self.settings.max_concurrent {
            return Claim::AtCapacity;
        }
        map.insert(
            incident_id,
            InFlight {
                incident_id,
                started_at: Utc::now(),
                cancelled: false,
            },
        );
        Claim::Claimed
    }

    fn release(&self, incident_id: i64) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&incident_id);
        self.slot_freed.notify_one();
    }

    fn should_stop(&self, incident_id: i64) -> bool {
        if self.emergency_stopped() {
            if let Some(e) = self
                .in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get_mut(&incident_id)
            {
                e.cancelled = true;
            }
            return true;
        }
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&incident_id)
            .is_some_and(|e| e.cancelled)
    }

    // ── Batch execution ───────────────────────────────────────────────────

    /// Dequeue loop. Never dequeues while stopped or at capacity; each accepted
    /// batch runs on its own task holding one slot.
    pub async fn run(self: Arc<Self>) {
        info!(max_concurrent = self.settings.max_concurrent, "executor started");
        loop {
            if self.emergency_stopped() {
                let _ = tokio::time::timeout(IDLE_WAIT, self.resumed.notified()).await;
                continue;
            }
            if self.in_flight_count() >= self.settings.max_concurrent {
                let _ = tokio::time::timeout(IDLE_WAIT, self.slot_freed.notified()).await;
                continue;
            }
            let batch: RemediationBatch =
                match self.queues.recv_timeout(QueueName::Remediation, IDLE_WAIT).await {
                    Ok(Some(b)) => b,
                    Ok(None) => continue,
                    Err(e) => {
                        error!("executor dequeue failed: {e:#}");
                        tokio::time::sleep(LOOP_BACKOFF).await;
                        continue;
                    }
                };
            let id = batch.incident_id;
            if let Err(e) = self.dispatch(batch) {
                error!(incident_id = id, "failed to requeue batch: {e:#}");
            }
        }
    }

    /// Hands a dequeued batch to its own task. The batch goes back on the queue
    /// while stopped or when every slot is taken; a second batch for an
    /// incident already in flight is dropped.
    pub fn dispatch(self: &Arc<Self>, batch: RemediationBatch) -> Result<Dispatch> {
        if self.emergency_stopped() {
            self.queues.push(QueueName::Remediation, &batch)?;
            return Ok(Dispatch::Requeued);
        }
        match self.claim(batch.incident_id) {
            Claim::Claimed => {}
            Claim::AtCapacity => {
                info!(incident_id = batch.incident_id, "no free remediation slot, requeueing batch");
                self.queues.push(QueueName::Remediation, &batch)?;
                return Ok(Dispatch::Requeued);
            }
            Claim::AlreadyInFlight => {
                warn!(
                    incident_id = batch.incident_id,
                    "incident already has a batch in flight, dropping duplicate"
                );
                return Ok(Dispatch::Duplicate);
            }
        }
        let me = Arc::clone(self);
        tokio::spawn(async move {
            let id = batch.incident_id;
            if let Err(e) = me.run_claimed(&batch).await {
                error!(incident_id = id, "remediation batch failed: {e:#}");
            }
            me.release(id);
        });
        Ok(Dispatch::Started)
    }

    /// Runs one batch inline. Returns `Skipped` without touching the incident
    /// when no slot is free.
    pub async fn execute_batch(&self, batch: &RemediationBatch) -> Result<BatchOutcome> {
        match self.claim(batch.incident_id) {
            Claim::Claimed => {}
            Claim::AtCapacity => return Ok(BatchOutcome::Skipped("no free remediation slot")),
            Claim::AlreadyInFlight => {
                return Ok(BatchOutcome::Skipped("incident already in flight"))
            }
        }
        let res = self.run_claimed(batch).await;
        self.release(batch.incident_id);
        res
    }

    async fn run_claimed(&self, batch: &RemediationBatch) -> Result<BatchOutcome> {
        let Some(incident) = self.db.get_incident(batch.incident_id)? else {
            warn!(incident_id = batch.incident_id, "incident not found, dropping batch");
            return Ok(BatchOutcome::Skipped("incident not found"));
        };
        if !batch.manual_trigger && !self.auto_enabled() {
            info!(
                incident_id = incident.id,
                "auto remediation disabled, leaving fixes pending"
            );
            return Ok(BatchOutcome::Skipped("auto remediation disabled"));
        }
        if self.emergency_stopped() {
            self.queues.push(QueueName::Remediation, batch)?;
            return Ok(BatchOutcome::Skipped("emergency stop active"));
        }
        if !self
            .db
            .transition_incident(incident.id, IncidentStatus::Fixing)?
        {
            info!(
                incident_id = incident.id,
                status = incident.status.as_str(),
                "incident not ready for fixing, dropping batch"
            );
            return Ok(BatchOutcome::Skipped("incident not at analyzing"));
        }
        info!(
            incident_id = incident.id,
            fixes = batch.fixes.len(),
            manual = batch.manual_trigger,
            "executing remediation batch"
        );

        let mut executed = Vec::new();
        let mut succeeded = 0usize;
        let mut last_error = String::new();
        let mut cancelled = false;

        for (i, fix) in batch.fixes.iter().enumerate() {
            if self.should_stop(incident.id) {
                let skipped = self.cancel_pending(&batch.fixes[i..])?;
                warn!(incident_id = incident.id, skipped, "batch cancelled by emergency stop");
                cancelled = true;
                break;
            }
            match self.db.get_remediation(fix.remediation_id)? {
                Some(r) if r.status == RemediationStatus::Pending => {}
                Some(r) => {
                    info!(
                        remediation_id = r.id,
                        status = r.status.as_str(),
                        "remediation not pending, skipping"
                    );
                    continue;
                }
                None => {
                    warn!(remediation_id = fix.remediation_id, "remediation row missing, skipping");
                    continue;
                }
            }

            executed.push(fix.remediation_id);
            match self.apply_fix(&incident, fix).await {
                Ok(()) => succeeded += 1,
                Err(e) => {
                    last_error = format!("{e:#}");
                    let halt = fix.confidence < HALT_CONFIDENCE || !fix.retryable;
                    if halt {
                        warn!(
                            incident_id = incident.id,
                            remediation_id = fix.remediation_id,
                            confidence = fix.confidence,
                            "fix failed, halting batch"
                        );
                        break;
                    }
                    info!(
                        incident_id = incident.id,
                        remediation_id = fix.remediation_id,
                        "retryable fix failed, continuing batch"
                    );
                }
            }
        }

        let status = if succeeded > 0 {
            IncidentStatus::Resolved
        } else {
            IncidentStatus::Failed
        };
        self.db.transition_incident(incident.id, status)?;

        if status == IncidentStatus::Resolved {
            self.queues.push(
                QueueName::Validation,
                &ValidationJob {
                    incident_id: incident.id,
                    validation_type: "post_remediation".into(),
                    queued_at: Utc::now(),
                },
            )?;
            info!(incident_id = incident.id, succeeded, "incident resolved");
            let _ = self.event_tx.send(PipelineEvent::Resolved {
                incident_id: incident.id,
                message: format!("{succeeded} of {} fix(es) applied", batch.fixes.len()),
            });
        } else {
            let message = if cancelled && executed.is_empty() {
                "cancelled by emergency stop before any fix ran".to_string()
            } else {
                last_error
            };
            warn!(incident_id = incident.id, "incident failed: {message}");
            let _ = self.event_tx.send(PipelineEvent::Failed {
                incident_id: incident.id,
                message,
            });
        }

        Ok(BatchOutcome::Completed {
            status,
            executed,
            succeeded,
            cancelled,
        })
    }

    /// Closes out fixes a cancelled batch never reached so they do not linger as pending.
    fn cancel_pending(&self, fixes: &[FixSpec]) -> Result<usize> {
        let mut count = 0;
        for fix in fixes {
            let pending = self
                .db
                .get_remediation(fix.remediation_id)?
                .is_some_and(|r| r.status == RemediationStatus::Pending);
            if pending {
                self.db
                    .mark_remediation_failed(fix.remediation_id, CANCELLED_ERROR)?;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn apply_fix(&self, incident: &Incident, fix: &FixSpec) -> Result<()> {
        self.db.mark_remediation_in_progress(fix.remediation_id)?;
        let channel = self.channels.for_fix(fix.fix_type);
        let result = match tokio::time::timeout(
            self.settings.remediation_timeout,
            channel.apply(incident, fix),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(anyhow::anyhow!(
                "timed out after {}s",
                self.settings.remediation_timeout.as_secs()
            )),
        };
        match result {
            Ok(outcome) => {
                let mut details = outcome.details;
                if let Value::Object(map) = &mut details {
                    map.insert("message".into(), json!(outcome.message));
                    map.insert("channel".into(), json!(channel.name()));
                }
                self.db
                    .mark_remediation_success(fix.remediation_id, &outcome.rollback, &details)?;
                info!(
                    incident_id = incident.id,
                    remediation_id = fix.remediation_id,
                    fix_type = fix.fix_type.as_str(),
                    "fix applied: {}",
                    outcome.message
                );
                Ok(())
            }
            Err(e) => {
                self.db
                    .mark_remediation_failed(fix.remediation_id, &format!("{e:#}"))?;
                Err(e)
            }
        }
    }

    // ── Operator actions ──────────────────────────────────────────────────

    /// Undoes every successful remediation of an incident, newest first.
    /// With nothing to undo the incident is left as it is.
    pub async fn rollback(&self, incident_id: i64) -> Result<RollbackReport, ExecutorError> {
        let incident = self
            .db
            .get_incident(incident_id)?
            .ok_or(ExecutorError::NotFound(incident_id))?;
        if self.is_in_flight(incident_id) {
            return Err(ExecutorError::Conflict(format!(
                "incident {incident_id} has remediation in progress"
            )));
        }
        if !incident.status.can_transition_to(IncidentStatus::RolledBack) {
            return Err(ExecutorError::InvalidState(format!(
                "cannot roll back incident in status {}",
                incident.status.as_str()
            )));
        }

        let successes = self
            .db
            .list_remediations_with_status(incident_id, RemediationStatus::Success)?;
        if successes.is_empty() {
            info!(incident_id, "no successful remediations, nothing to roll back");
            return Ok(RollbackReport {
                incident_id,
                status: incident.status,
                rolled_back: Vec::new(),
                errors: Vec::new(),
            });
        }

        let mut rolled_back = Vec::new();
        let mut errors = Vec::new();
        for r in successes.iter().rev() {
            let res = match self.channels.for_rollback(&r.rollback_data) {
                None => Ok(()),
                Some(ch) => {
                    match tokio::time::timeout(
                        self.settings.rollback_timeout,
                        ch.rollback(&r.rollback_data),
                    )
                    .await
                    {
                        Ok(res) => res,
                        Err(_) => Err(anyhow::anyhow!(
                            "timed out after {}s",
                            self.settings.rollback_timeout.as_secs()
                        )),
                    }
                }
            };
            match res {
                Ok(()) => {
                    if self.db.mark_remediation_rolled_back(r.id)? {
                        rolled_back.push(r.id);
                    }
                }
                Err(e) => {
                    let msg = format!("{e:#}");
                    error!(incident_id, remediation_id = r.id, "rollback failed: {msg}");
                    self.db.record_rollback_error(r.id, &msg)?;
                    errors.push(format!("remediation {}: {msg}", r.id));
                }
            }
        }

        self.db
            .transition_incident(incident_id, IncidentStatus::RolledBack)?;
        info!(incident_id, count = rolled_back.len(), "incident rolled back");
        let _ = self.event_tx.send(PipelineEvent::RolledBack {
            incident_id,
            message: format!("{} remediation(s) rolled back", rolled_back.len()),
        });
        Ok(RollbackReport {
            incident_id,
            status: IncidentStatus::RolledBack,
            rolled_back,
            errors,
        })
    }

    /// Re-runs remediation for an incident parked at analyzing: pending fixes
    /// are requeued as a manual batch, otherwise fixes are regenerated.
    pub fn trigger_manual(&self, incident_id: i64) -> Result<ManualTrigger, ExecutorError> {
        let incident = self
            .db
            .get_incident(incident_id)?
            .ok_or(ExecutorError::NotFound(incident_id))?;
        if self.is_in_flight(incident_id) {
            return Err(ExecutorError::Conflict(format!(
                "incident {incident_id} has remediation in progress"
            )));
        }
        if incident.status != IncidentStatus::Analyzing {
            return Err(ExecutorError::InvalidState(format!(
                "manual remediation needs an analyzed incident, status is {}",
                incident.status.as_str()
            )));
        }

        let pending = self
            .db
            .list_remediations_with_status(incident_id, RemediationStatus::Pending)?;
        if !pending.is_empty() {
            self.queues.push(
                QueueName::Remediation,
                &RemediationBatch {
                    incident_id,
                    fixes: pending.iter().map(FixSpec::from).collect(),
                    queued_at: Utc::now(),
                    manual_trigger: true,
                },
            )?;
            info!(incident_id, count = pending.len(), "manual remediation queued");
            return Ok(ManualTrigger::Requeued {
                count: pending.len(),
            });
        }

        let rca = &incident.analysis_data["root_cause_analysis"];
        let suggested_fixes = rca["suggested_fixes"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        self.queues.push(
            QueueName::Fix,
            &FixRequest {
                incident_id,
                root_cause: incident.root_cause.clone().unwrap_or_default(),
                suggested_fixes,
                confidence: incident.confidence_score,
                queued_at: Utc::now(),
            },
        )?;
        info!(incident_id, "no pending fixes, requested regeneration");
        Ok(ManualTrigger::Regenerating)
    }
}
