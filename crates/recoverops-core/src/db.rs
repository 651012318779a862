use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use std::sync::Mutex;

use crate::types::{
    clamp_confidence, Commit, FailureType, FixType, GeneratedFix, Incident, IncidentFilter,
    IncidentStatus, LogEntry, NewIncident, PipelineRun, PipelineStatus, Remediation,
    RemediationStatus, RollbackData, Severity,
};

const SCHEMA_SQL: &str = include_str!("../../../schema.sql");

pub struct Db {
    conn: Mutex<Connection>,
}

// ── Auxiliary types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct IncidentStats {
    pub total_incidents: i64,
    pub active_incidents: i64,
    pub resolved_today: i64,
    /// Percentage of incidents detected in the last 30 days that were resolved.
    pub success_rate: f64,
    pub period: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyTrend {
    pub date: String,
    pub total: i64,
    pub resolved: i64,
    pub failed: i64,
}

/// Operator-editable incident fields.
#[derive(Debug, Clone, Default)]
pub struct IncidentUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub severity: Option<Severity>,
    pub root_cause: Option<String>,
}

// ── Timestamp helpers ─────────────────────────────────────────────────────

fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|ndt| ndt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

fn parse_opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_ts(&s))
}

fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn now_str() -> String {
    fmt_ts(&Utc::now())
}

// ── Row mappers ───────────────────────────────────────────────────────────

fn parse_col<T>(idx: usize, raw: &str, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unrecognised value {raw:?}").into(),
        )
    })
}

fn json_col(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or(Value::Null)
}

const INCIDENT_COLS: &str = "id, title, description, status, severity, source_type, source_id, \
     repository, branch, commit_sha, failure_type, error_message, root_cause, confidence_score, \
     analysis_data, detected_at, resolved_at, updated_at";

fn row_to_incident(row: &rusqlite::Row<'_>) -> rusqlite::Result<Incident> {
    let status: String = row.get(3)?;
    let severity: String = row.get(4)?;
    let failure_type: String = row.get(10)?;
    let analysis_data: String = row.get(14)?;
    let detected_at: String = row.get(15)?;
    let updated_at: String = row.get(17)?;
    Ok(Incident {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        status: parse_col(3, &status, IncidentStatus::parse)?,
        severity: Severity::parse(&severity).unwrap_or_default(),
        source_type: row.get(5)?,
        source_id: row.get(6)?,
        repository: row.get(7)?,
        branch: row.get(8)?,
        commit_sha: row.get(9)?,
        failure_type: FailureType::parse(&failure_type).unwrap_or_default(),
        error_message: row.get(11)?,
        root_cause: row.get(12)?,
        confidence_score: row.get(13)?,
        analysis_data: json_col(&analysis_data),
        detected_at: parse_ts(&detected_at),
        resolved_at: parse_opt_ts(row.get(16)?),
        updated_at: parse_ts(&updated_at),
    })
}

const REMEDIATION_COLS: &str = "id, incident_id, fix_type, description, fix_content, \
     target_files, confidence, retryable, validation_steps, status, error_message, \
     rollback_data, details, validation_passed, validation_results, started_at, \
     completed_at, created_at";

fn row_to_remediation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Remediation> {
    let fix_type: String = row.get(2)?;
    let target_files: String = row.get(5)?;
    let validation_steps: String = row.get(8)?;
    let status: String = row.get(9)?;
    let rollback_data: String = row.get(11)?;
    let details: String = row.get(12)?;
    let validation_results: Option<String> = row.get(14)?;
    let created_at: String = row.get(17)?;
    Ok(Remediation {
        id: row.get(0)?,
        incident_id: row.get(1)?,
        fix_type: parse_col(2, &fix_type, FixType::parse)?,
        description: row.get(3)?,
        fix_content: row.get(4)?,
        target_files: serde_json::from_str(&target_files).unwrap_or_default(),
        confidence: row.get(6)?,
        retryable: row.get::<_, i64>(7)? != 0,
        validation_steps: serde_json::from_str(&validation_steps).unwrap_or_default(),
        status: parse_col(9, &status, RemediationStatus::parse)?,
        error_message: row.get(10)?,
        rollback_data: serde_json::from_str(&rollback_data).unwrap_or_default(),
        details: json_col(&details),
        validation_passed: row.get::<_, Option<i64>>(13)?.map(|v| v != 0),
        validation_results: validation_results.map(|s| json_col(&s)),
        started_at: parse_opt_ts(row.get(15)?),
        completed_at: parse_opt_ts(row.get(16)?),
        created_at: parse_ts(&created_at),
    })
}

const PIPELINE_RUN_COLS: &str = "id, platform, external_id, run_number, status, repository, \
     branch, commit_sha, commit_message, author, started_at, finished_at, logs_url, metadata, \
     incident_id";

fn row_to_pipeline_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<PipelineRun> {
    let status: String = row.get(4)?;
    let metadata: String = row.get(13)?;
    Ok(PipelineRun {
        id: row.get(0)?,
        platform: row.get(1)?,
        external_id: row.get(2)?,
        run_number: row.get(3)?,
        status: PipelineStatus::parse(&status).unwrap_or_default(),
        repository: row.get(5)?,
        branch: row.get(6)?,
        commit_sha: row.get(7)?,
        commit_message: row.get(8)?,
        author: row.get(9)?,
        started_at: parse_opt_ts(row.get(10)?),
        finished_at: parse_opt_ts(row.get(11)?),
        logs_url: row.get(12)?,
        metadata: json_col(&metadata),
        incident_id: row.get(14)?,
    })
}

fn row_to_log_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogEntry> {
    let metadata: String = row.get(5)?;
    let logged_at: String = row.get(6)?;
    Ok(LogEntry {
        id: row.get(0)?,
        source_type: row.get(1)?,
        source_id: row.get(2)?,
        level: row.get(3)?,
        message: row.get(4)?,
        metadata: json_col(&metadata),
        logged_at: parse_ts(&logged_at),
    })
}

fn row_to_commit(row: &rusqlite::Row<'_>) -> rusqlite::Result<Commit> {
    let pushed_at: String = row.get(5)?;
    Ok(Commit {
        repository: row.get(0)?,
        branch: row.get(1)?,
        sha: row.get(2)?,
        message: row.get(3)?,
        author: row.get(4)?,
        pushed_at: parse_ts(&pushed_at),
    })
}

// ── Db impl ───────────────────────────────────────────────────────────────

impl Db {
    pub fn raw_conn(&self) -> &std::sync::Mutex<Connection> {
        &self.conn
    }

    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database at {path:?}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate(&mut self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema migrations")?;
        Ok(())
    }

    // ── Incidents ─────────────────────────────────────────────────────────

    pub fn insert_incident(&self, inc: &NewIncident) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let now = now_str();
        let analysis_data = if inc.analysis_data.is_null() {
            "{}".to_string()
        } else {
            inc.analysis_data.to_string()
        };
        conn.execute(
            "INSERT INTO incidents \
             (title, description, status, severity, source_type, source_id, repository, \
              branch, commit_sha, failure_type, error_message, confidence_score, \
              analysis_data, detected_at, updated_at) \
             VALUES (?1, ?2, 'detected', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
            params![
                inc.title,
                inc.description,
                inc.severity.as_str(),
                inc.source_type,
                inc.source_id,
                inc.repository,
                inc.branch,
                inc.commit_sha,
                inc.failure_type.as_str(),
                inc.error_message,
                clamp_confidence(inc.confidence_score),
                analysis_data,
                now,
            ],
        )
        .context("insert_incident")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_incident(&self, id: i64) -> Result<Option<Incident>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                &format!("SELECT {INCIDENT_COLS} FROM incidents WHERE id = ?1"),
                params![id],
                row_to_incident,
            )
            .optional()
            .context("get_incident")?;
        Ok(result)
    }

    /// Newest first. `limit` is capped at 1000.
    pub fn list_incidents(&self, filter: &IncidentFilter) -> Result<Vec<Incident>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let limit = filter.limit.unwrap_or(100).clamp(1, 1000);
        let offset = filter.offset.unwrap_or(0).max(0);
        let mut stmt = conn.prepare(&format!(
            "SELECT {INCIDENT_COLS} FROM incidents \
             WHERE (?1 IS NULL OR status = ?1) \
               AND (?2 IS NULL OR severity = ?2) \
               AND (?3 IS NULL OR repository = ?3) \
             ORDER BY detected_at DESC, id DESC \
             LIMIT ?4 OFFSET ?5"
        ))?;
        let incidents = stmt
            .query_map(
                params![
                    filter.status.map(|s| s.as_str()),
                    filter.severity.map(|s| s.as_str()),
                    filter.repository,
                    limit,
                    offset,
                ],
                row_to_incident,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_incidents")?;
        Ok(incidents)
    }

    /// An active incident with the same (failure_type, source_id) detected inside the window.
    pub fn find_active_duplicate(
        &self,
        failure_type: FailureType,
        source_id: &str,
        window_secs: i64,
    ) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let cutoff = fmt_ts(&(Utc::now() - Duration::seconds(window_secs)));
        let id = conn
            .query_row(
                "SELECT id FROM incidents \
                 WHERE failure_type = ?1 AND source_id = ?2 \
                   AND status IN ('detected', 'analyzing', 'fixing') \
                   AND detected_at >= ?3 \
                 ORDER BY id DESC LIMIT 1",
                params![failure_type.as_str(), source_id, cutoff],
                |r| r.get(0),
            )
            .optional()
            .context("find_active_duplicate")?;
        Ok(id)
    }

    /// Moves an incident along one state-machine edge. Returns false when the
    /// edge does not exist or the status changed underneath us.
    pub fn transition_incident(&self, id: i64, to: IncidentStatus) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM incidents WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .optional()
            .context("transition_incident")?;
        let Some(from) = current.as_deref().and_then(IncidentStatus::parse) else {
            return Ok(false);
        };
        if !from.can_transition_to(to) {
            return Ok(false);
        }
        let now = now_str();
        let resolved_at = (to == IncidentStatus::Resolved).then(|| now.clone());
        let changed = conn
            .execute(
                "UPDATE incidents SET status = ?1, updated_at = ?2, \
                 resolved_at = COALESCE(?3, resolved_at) \
                 WHERE id = ?4 AND status = ?5",
                params![to.as_str(), now, resolved_at, id, from.as_str()],
            )
            .context("transition_incident")?;
        Ok(changed == 1)
    }

    /// Stores the analysis and moves detected -> analyzing in one step.
    /// Returns false if the incident was no longer at detected.
    pub fn record_analysis(
        &self,
        id: i64,
        root_cause: &str,
        confidence: f64,
        analysis: &Value,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let existing: Option<String> = conn
            .query_row(
                "SELECT analysis_data FROM incidents WHERE id = ?1 AND status = 'detected'",
                params![id],
                |r| r.get(0),
            )
            .optional()
            .context("record_analysis")?;
        let Some(existing) = existing else {
            return Ok(false);
        };
        let mut data = json_col(&existing);
        if !data.is_object() {
            data = Value::Object(Default::default());
        }
        data["root_cause_analysis"] = analysis.clone();
        let changed = conn
            .execute(
                "UPDATE incidents SET root_cause = ?1, confidence_score = ?2, \
                 analysis_data = ?3, status = 'analyzing', updated_at = ?4 \
                 WHERE id = ?5 AND status = 'detected'",
                params![
                    root_cause,
                    clamp_confidence(confidence),
                    data.to_string(),
                    now_str(),
                    id
                ],
            )
            .context("record_analysis")?;
        Ok(changed == 1)
    }

    pub fn update_incident(&self, id: i64, upd: &IncidentUpdate) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let changed = conn
            .execute(
                "UPDATE incidents SET \
                 title = COALESCE(?1, title), \
                 description = COALESCE(?2, description), \
                 severity = COALESCE(?3, severity), \
                 root_cause = COALESCE(?4, root_cause), \
                 updated_at = ?5 \
                 WHERE id = ?6",
                params![
                    upd.title,
                    upd.description,
                    upd.severity.map(|s| s.as_str()),
                    upd.root_cause,
                    now_str(),
                    id
                ],
            )
            .context("update_incident")?;
        Ok(changed == 1)
    }

    pub fn list_resolved_similar(
        &self,
        failure_type: FailureType,
        repository: &str,
        exclude_id: i64,
        limit: i64,
    ) -> Result<Vec<Incident>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {INCIDENT_COLS} FROM incidents \
             WHERE failure_type = ?1 AND repository = ?2 AND status = 'resolved' AND id != ?3 \
             ORDER BY resolved_at DESC LIMIT ?4"
        ))?;
        let incidents = stmt
            .query_map(
                params![failure_type.as_str(), repository, exclude_id, limit],
                row_to_incident,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_resolved_similar")?;
        Ok(incidents)
    }

    pub fn incident_stats(&self) -> Result<IncidentStats> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM incidents", [], |r| r.get(0))?;
        let active: i64 = conn.query_row(
            "SELECT COUNT(*) FROM incidents WHERE status IN ('detected', 'analyzing', 'fixing')",
            [],
            |r| r.get(0),
        )?;
        let resolved_today: i64 = conn.query_row(
            "SELECT COUNT(*) FROM incidents \
             WHERE status = 'resolved' AND date(resolved_at) = date('now')",
            [],
            |r| r.get(0),
        )?;
        let cutoff = fmt_ts(&(Utc::now() - Duration::days(30)));
        let (recent, recent_resolved): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(status = 'resolved'), 0) FROM incidents \
                 WHERE detected_at >= ?1",
                params![cutoff],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .context("incident_stats")?;
        let success_rate = if recent > 0 {
            (recent_resolved as f64 / recent as f64 * 1000.0).round() / 10.0
        } else {
            0.0
        };
        Ok(IncidentStats {
            total_incidents: total,
            active_incidents: active,
            resolved_today,
            success_rate,
            period: "last_30_days",
        })
    }

    pub fn daily_trends(&self, days: i64) -> Result<Vec<DailyTrend>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let cutoff = fmt_ts(&(Utc::now() - Duration::days(days.clamp(1, 90))));
        let mut stmt = conn.prepare(
            "SELECT date(detected_at) AS d, COUNT(*), \
             COALESCE(SUM(status = 'resolved'), 0), COALESCE(SUM(status = 'failed'), 0) \
             FROM incidents WHERE detected_at >= ?1 GROUP BY d ORDER BY d",
        )?;
        let trends = stmt
            .query_map(params![cutoff], |r| {
                Ok(DailyTrend {
                    date: r.get(0)?,
                    total: r.get(1)?,
                    resolved: r.get(2)?,
                    failed: r.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("daily_trends")?;
        Ok(trends)
    }

    // ── Remediations ──────────────────────────────────────────────────────

    pub fn insert_remediation(&self, incident_id: i64, fix: &GeneratedFix) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO remediations \
             (incident_id, fix_type, description, fix_content, target_files, confidence, \
              retryable, validation_steps, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9)",
            params![
                incident_id,
                fix.fix_type.as_str(),
                fix.description,
                fix.content,
                serde_json::to_string(&fix.target_files)?,
                clamp_confidence(fix.confidence),
                fix.retryable as i64,
                serde_json::to_string(&fix.validation_steps)?,
                now_str(),
            ],
        )
        .context("insert_remediation")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_remediation(&self, id: i64) -> Result<Option<Remediation>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                &format!("SELECT {REMEDIATION_COLS} FROM remediations WHERE id = ?1"),
                params![id],
                row_to_remediation,
            )
            .optional()
            .context("get_remediation")?;
        Ok(result)
    }

    /// Generation order.
    pub fn list_remediations(&self, incident_id: i64) -> Result<Vec<Remediation>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {REMEDIATION_COLS} FROM remediations WHERE incident_id = ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt
            .query_map(params![incident_id], row_to_remediation)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_remediations")?;
        Ok(rows)
    }

    pub fn list_remediations_with_status(
        &self,
        incident_id: i64,
        status: RemediationStatus,
    ) -> Result<Vec<Remediation>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {REMEDIATION_COLS} FROM remediations \
             WHERE incident_id = ?1 AND status = ?2 ORDER BY id ASC"
        ))?;
        let rows = stmt
            .query_map(params![incident_id, status.as_str()], row_to_remediation)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_remediations_with_status")?;
        Ok(rows)
    }

    pub fn mark_remediation_in_progress(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE remediations SET status = 'in_progress', started_at = ?1, \
             error_message = NULL WHERE id = ?2",
            params![now_str(), id],
        )
        .context("mark_remediation_in_progress")?;
        Ok(())
    }

    pub fn mark_remediation_success(
        &self,
        id: i64,
        rollback: &RollbackData,
        details: &Value,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE remediations SET status = 'success', rollback_data = ?1, details = ?2, \
             completed_at = ?3 WHERE id = ?4",
            params![
                serde_json::to_string(rollback)?,
                details.to_string(),
                now_str(),
                id
            ],
        )
        .context("mark_remediation_success")?;
        Ok(())
    }

    pub fn mark_remediation_failed(&self, id: i64, error: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE remediations SET status = 'failed', error_message = ?1, completed_at = ?2 \
             WHERE id = ?3",
            params![error, now_str(), id],
        )
        .context("mark_remediation_failed")?;
        Ok(())
    }

    /// Only a successful remediation can be rolled back; anything else is left untouched.
    pub fn mark_remediation_rolled_back(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let changed = conn
            .execute(
                "UPDATE remediations SET status = 'rolled_back', completed_at = ?1 \
                 WHERE id = ?2 AND status = 'success'",
                params![now_str(), id],
            )
            .context("mark_remediation_rolled_back")?;
        Ok(changed == 1)
    }

    pub fn record_rollback_error(&self, id: i64, error: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE remediations SET error_message = ?1 WHERE id = ?2",
            params![format!("rollback failed: {error}"), id],
        )
        .context("record_rollback_error")?;
        Ok(())
    }

    pub fn record_validation(&self, id: i64, passed: bool, results: &Value) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE remediations SET validation_passed = ?1, validation_results = ?2 WHERE id = ?3",
            params![passed as i64, results.to_string(), id],
        )
        .context("record_validation")?;
        Ok(())
    }

    // ── Pipeline Runs ─────────────────────────────────────────────────────

    /// Insert or update keyed by (platform, external_id). Returns the row id and
    /// the status stored before this call, if the run already existed.
    pub fn upsert_pipeline_run(&self, run: &PipelineRun) -> Result<(i64, Option<PipelineStatus>)> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let now = now_str();
        let existing: Option<(i64, String)> = conn
            .query_row(
                "SELECT id, status FROM pipeline_runs WHERE platform = ?1 AND external_id = ?2",
                params![run.platform, run.external_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .context("upsert_pipeline_run")?;
        let started_at = run.started_at.as_ref().map(fmt_ts);
        let finished_at = run.finished_at.as_ref().map(fmt_ts);
        match existing {
            Some((id, prev)) => {
                conn.execute(
                    "UPDATE pipeline_runs SET status = ?1, \
                     run_number = COALESCE(?2, run_number), \
                     repository = CASE WHEN ?3 = '' THEN repository ELSE ?3 END, \
                     branch = CASE WHEN ?4 = '' THEN branch ELSE ?4 END, \
                     commit_sha = CASE WHEN ?5 = '' THEN commit_sha ELSE ?5 END, \
                     commit_message = CASE WHEN ?6 = '' THEN commit_message ELSE ?6 END, \
                     author = CASE WHEN ?7 = '' THEN author ELSE ?7 END, \
                     started_at = COALESCE(?8, started_at), \
                     finished_at = COALESCE(?9, finished_at), \
                     logs_url = CASE WHEN ?10 = '' THEN logs_url ELSE ?10 END, \
                     metadata = ?11, updated_at = ?12 \
                     WHERE id = ?13",
                    params![
                        run.status.as_str(),
                        run.run_number,
                        run.repository,
                        run.branch,
                        run.commit_sha,
                        run.commit_message,
                        run.author,
                        started_at,
                        finished_at,
                        run.logs_url,
                        run.metadata.to_string(),
                        now,
                        id,
                    ],
                )
                .context("upsert_pipeline_run")?;
                Ok((id, PipelineStatus::parse(&prev)))
            }
            None => {
                conn.execute(
                    "INSERT INTO pipeline_runs \
                     (platform, external_id, run_number, status, repository, branch, \
                      commit_sha, commit_message, author, started_at, finished_at, logs_url, \
                      metadata, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
                    params![
                        run.platform,
                        run.external_id,
                        run.run_number,
                        run.status.as_str(),
                        run.repository,
                        run.branch,
                        run.commit_sha,
                        run.commit_message,
                        run.author,
                        started_at,
                        finished_at,
                        run.logs_url,
                        run.metadata.to_string(),
                        now,
                    ],
                )
                .context("upsert_pipeline_run")?;
                Ok((conn.last_insert_rowid(), None))
            }
        }
    }

    pub fn get_pipeline_run(&self, platform: &str, external_id: &str) -> Result<Option<PipelineRun>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                &format!(
                    "SELECT {PIPELINE_RUN_COLS} FROM pipeline_runs \
                     WHERE platform = ?1 AND external_id = ?2"
                ),
                params![platform, external_id],
                row_to_pipeline_run,
            )
            .optional()
            .context("get_pipeline_run")?;
        Ok(result)
    }

    pub fn count_pipeline_runs(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn.query_row("SELECT COUNT(*) FROM pipeline_runs", [], |r| r.get(0))?;
        Ok(n)
    }

    pub fn link_pipeline_run(&self, platform: &str, external_id: &str, incident_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE pipeline_runs SET incident_id = ?1, updated_at = ?2 \
             WHERE platform = ?3 AND external_id = ?4",
            params![incident_id, now_str(), platform, external_id],
        )
        .context("link_pipeline_run")?;
        Ok(())
    }

    // ── Logs & Commits ────────────────────────────────────────────────────

    pub fn insert_log_entry(
        &self,
        source_type: &str,
        source_id: &str,
        level: &str,
        message: &str,
        metadata: &Value,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO log_entries (source_type, source_id, level, message, metadata, logged_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                source_type,
                source_id,
                level,
                message,
                metadata.to_string(),
                now_str()
            ],
        )
        .context("insert_log_entry")?;
        Ok(conn.last_insert_rowid())
    }

    /// ERROR, WARN and FATAL entries for a source, newest first.
    pub fn recent_error_logs(&self, source_id: &str, limit: i64) -> Result<Vec<LogEntry>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, source_type, source_id, level, message, metadata, logged_at \
             FROM log_entries \
             WHERE source_id = ?1 AND upper(level) IN ('ERROR', 'WARN', 'WARNING', 'FATAL') \
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![source_id, limit], row_to_log_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("recent_error_logs")?;
        Ok(rows)
    }

    pub fn insert_commit(&self, commit: &Commit) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT OR IGNORE INTO commits (repository, branch, sha, message, author, pushed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                commit.repository,
                commit.branch,
                commit.sha,
                commit.message,
                commit.author,
                fmt_ts(&commit.pushed_at)
            ],
        )
        .context("insert_commit")?;
        Ok(())
    }

    pub fn recent_commits(&self, repository: &str, limit: i64) -> Result<Vec<Commit>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT repository, branch, sha, message, author, pushed_at FROM commits \
             WHERE repository = ?1 ORDER BY pushed_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![repository, limit], row_to_commit)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("recent_commits")?;
        Ok(rows)
    }

    // ── Queue Messages ────────────────────────────────────────────────────

    pub fn queue_push(&self, queue: &str, payload: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO queue_messages (queue, payload, enqueued_at) VALUES (?1, ?2, ?3)",
            params![queue, payload, now_str()],
        )
        .context("queue_push")?;
        Ok(conn.last_insert_rowid())
    }

    /// Removes and returns the oldest message on `queue`.
    pub fn queue_pop(&self, queue: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let payload = conn
            .query_row(
                "DELETE FROM queue_messages WHERE id = \
                 (SELECT id FROM queue_messages WHERE queue = ?1 ORDER BY id ASC LIMIT 1) \
                 RETURNING payload",
                params![queue],
                |r| r.get(0),
            )
            .optional()
            .context("queue_pop")?;
        Ok(payload)
    }

    pub fn queue_depth(&self, queue: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn
            .query_row(
                "SELECT COUNT(*) FROM queue_messages WHERE queue = ?1",
                params![queue],
                |r| r.get(0),
            )
            .context("queue_depth")?;
        Ok(n)
    }

    // ── Config ────────────────────────────────────────────────────────────

    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let v = conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()
            .context("get_config")?;
        Ok(v)
    }

    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO config (key, value, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now_str()],
        )
        .context("set_config")?;
        Ok(())
    }

    pub fn list_config(&self) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare("SELECT key, value FROM config ORDER BY key")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_config")?;
        Ok(rows)
    }
}
