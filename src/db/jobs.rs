//! Job rows and their status state machine

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use super::{json_column, parsed_column, to_json_text};
use crate::error::{AuditError, Result};

/// Job status
///
/// Transitions only move forward:
/// `queued -> running -> (done | error | pending -> (done | error))`.
/// A queued job may also fail directly when its input is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Pending,
    Done,
    Error,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Pending => "pending",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Error)
                | (Running, Pending)
                | (Running, Done)
                | (Running, Error)
                | (Pending, Done)
                | (Pending, Error)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "pending" => Ok(JobStatus::Pending),
            "done" => Ok(JobStatus::Done),
            "error" => Ok(JobStatus::Error),
            other => Err(AuditError::Internal(format!("unknown job status: {other}"))),
        }
    }
}

/// Job row from database
#[derive(Debug, Clone, Serialize)]
pub struct JobRow {
    pub id: i64,
    pub task_id: Option<String>,
    pub kind: String,
    pub status: JobStatus,
    pub params: Option<Value>,
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            task_id: row.get("task_id")?,
            kind: row.get("kind")?,
            status: parsed_column(row, "status")?,
            params: json_column(row, "params")?,
            result: json_column(row, "result")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Input for creating a job
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: String,
    pub params: Value,
    /// Task-queue correlation id, assigned before the message is queued
    pub task_id: Option<String>,
}

/// Insert a queued job
pub fn insert_job(conn: &Connection, job: &NewJob) -> Result<JobRow> {
    let now = Utc::now();
    conn.execute(
        "INSERT INTO analysis_jobs (kind, status, params, task_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![
            job.kind,
            JobStatus::Queued.as_str(),
            to_json_text(&job.params)?,
            job.task_id,
            now
        ],
    )?;

    let id = conn.last_insert_rowid();
    debug!(job_id = id, kind = %job.kind, "Job created");
    get_job(conn, id)?.ok_or(AuditError::JobNotFound(id))
}

/// Get job by ID
pub fn get_job(conn: &Connection, id: i64) -> Result<Option<JobRow>> {
    let job = conn
        .query_row(
            "SELECT * FROM analysis_jobs WHERE id = ?1",
            params![id],
            JobRow::from_row,
        )
        .optional()?;
    Ok(job)
}

/// Move a job to `to`, optionally replacing its result.
///
/// The update is conditional on the status read beforehand, so a concurrent
/// writer that got there first makes this call fail instead of overwriting.
pub fn transition_job(
    conn: &Connection,
    id: i64,
    to: JobStatus,
    result: Option<&Value>,
) -> Result<JobRow> {
    let current = get_job(conn, id)?.ok_or(AuditError::JobNotFound(id))?;
    if !current.status.can_transition_to(to) {
        return Err(invalid_transition(id, current.status, to));
    }

    let result_text = result.map(to_json_text).transpose()?;
    let changed = conn.execute(
        "UPDATE analysis_jobs
         SET status = ?1, result = COALESCE(?2, result), updated_at = ?3
         WHERE id = ?4 AND status = ?5",
        params![
            to.as_str(),
            result_text,
            Utc::now(),
            id,
            current.status.as_str()
        ],
    )?;

    if changed == 0 {
        let now_status = get_job(conn, id)?
            .map(|job| job.status)
            .ok_or(AuditError::JobNotFound(id))?;
        return Err(invalid_transition(id, now_status, to));
    }

    debug!(job_id = id, from = %current.status, to = %to, "Job transitioned");
    get_job(conn, id)?.ok_or(AuditError::JobNotFound(id))
}

fn invalid_transition(id: i64, from: JobStatus, to: JobStatus) -> AuditError {
    AuditError::InvalidTransition {
        job_id: id,
        from: from.to_string(),
        to: to.to_string(),
    }
}
