//! Audit rows
//!
//! An audit is created `running` and receives exactly one terminal write.
//! Both terminal updates are guarded by `status = 'running'`, so a second
//! terminal write fails instead of overwriting the verdict.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use super::{json_column, parsed_column, to_json_text};
use crate::address::ContractAddress;
use crate::error::{AuditError, Result};
use crate::scoring::RiskLevel;

/// Audit status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Queued,
    Running,
    Done,
    Error,
}

impl AuditStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditStatus::Queued => "queued",
            AuditStatus::Running => "running",
            AuditStatus::Done => "done",
            AuditStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AuditStatus::Done | AuditStatus::Error)
    }
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditStatus {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(AuditStatus::Queued),
            "running" => Ok(AuditStatus::Running),
            "done" => Ok(AuditStatus::Done),
            "error" => Ok(AuditStatus::Error),
            other => Err(AuditError::Internal(format!("unknown audit status: {other}"))),
        }
    }
}

/// Audit row from database
#[derive(Debug, Clone, Serialize)]
pub struct AuditRow {
    pub id: i64,
    pub job_id: Option<i64>,
    pub address: String,
    #[serde(skip)]
    pub address_key: String,
    pub network: String,
    pub status: AuditStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub ai_score: Option<f64>,
    pub risk_level: Option<RiskLevel>,
    pub summary: Option<Value>,
    pub features: Option<Value>,
    pub details: Option<Value>,
}

impl AuditRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let risk_level: Option<String> = row.get("risk_level")?;
        let risk_level = risk_level
            .map(|level| {
                level.parse::<RiskLevel>().map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        0,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })
            })
            .transpose()?;

        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            address: row.get("address")?,
            address_key: row.get("address_key")?,
            network: row.get("network")?,
            status: parsed_column(row, "status")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
            ai_score: row.get("ai_score")?,
            risk_level,
            summary: json_column(row, "summary")?,
            features: json_column(row, "features")?,
            details: json_column(row, "details")?,
        })
    }
}

/// Verdict written when an audit completes
#[derive(Debug, Clone)]
pub struct AuditVerdict {
    pub ai_score: f64,
    pub risk_level: RiskLevel,
    pub summary: Value,
    pub features: Value,
    pub details: Value,
}

/// Create an audit in the running state
pub fn insert_running_audit(
    conn: &Connection,
    job_id: Option<i64>,
    address: &ContractAddress,
    network: &str,
) -> Result<AuditRow> {
    conn.execute(
        "INSERT INTO contract_audits (job_id, address, address_key, network, status, started_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            job_id,
            address.checksum(),
            address.lookup_key(),
            network,
            AuditStatus::Running.as_str(),
            Utc::now()
        ],
    )?;

    let id = conn.last_insert_rowid();
    debug!(audit_id = id, address = %address, network, "Audit created");
    get_audit(conn, id)?.ok_or(AuditError::AuditNotFound(id))
}

/// Terminal write: done with score, level and payloads
pub fn complete_audit(conn: &Connection, id: i64, verdict: &AuditVerdict) -> Result<AuditRow> {
    let changed = conn.execute(
        "UPDATE contract_audits
         SET status = ?1, ai_score = ?2, risk_level = ?3, summary = ?4,
             features = ?5, details = ?6, finished_at = ?7
         WHERE id = ?8 AND status = ?9",
        params![
            AuditStatus::Done.as_str(),
            verdict.ai_score,
            verdict.risk_level.as_str(),
            to_json_text(&verdict.summary)?,
            to_json_text(&verdict.features)?,
            to_json_text(&verdict.details)?,
            Utc::now(),
            id,
            AuditStatus::Running.as_str()
        ],
    )?;
    finish(conn, id, changed, AuditStatus::Done)
}

/// Terminal write: error with diagnostic details; score and level stay absent
pub fn fail_audit(conn: &Connection, id: i64, details: &Value) -> Result<AuditRow> {
    let changed = conn.execute(
        "UPDATE contract_audits
         SET status = ?1, details = ?2, finished_at = ?3
         WHERE id = ?4 AND status = ?5",
        params![
            AuditStatus::Error.as_str(),
            to_json_text(details)?,
            Utc::now(),
            id,
            AuditStatus::Running.as_str()
        ],
    )?;
    finish(conn, id, changed, AuditStatus::Error)
}

/// Error out every audit of `job_id` still running; returns how many moved
pub fn fail_running_audits_for_job(conn: &Connection, job_id: i64, details: &Value) -> Result<usize> {
    let changed = conn.execute(
        "UPDATE contract_audits
         SET status = ?1, details = ?2, finished_at = ?3
         WHERE job_id = ?4 AND status = ?5",
        params![
            AuditStatus::Error.as_str(),
            to_json_text(details)?,
            Utc::now(),
            job_id,
            AuditStatus::Running.as_str()
        ],
    )?;
    debug!(job_id, changed, "Running audits failed");
    Ok(changed)
}

fn finish(conn: &Connection, id: i64, changed: usize, to: AuditStatus) -> Result<AuditRow> {
    let audit = get_audit(conn, id)?.ok_or(AuditError::AuditNotFound(id))?;
    if changed == 0 {
        return Err(AuditError::Internal(format!(
            "audit {id} already finished as {}, refusing {to}",
            audit.status
        )));
    }
    debug!(audit_id = id, status = %to, "Audit finished");
    Ok(audit)
}

/// Get audit by ID
pub fn get_audit(conn: &Connection, id: i64) -> Result<Option<AuditRow>> {
    let audit = conn
        .query_row(
            "SELECT * FROM contract_audits WHERE id = ?1",
            params![id],
            AuditRow::from_row,
        )
        .optional()?;
    Ok(audit)
}

/// List audits newest first, optionally for one address (any casing)
pub fn list_audits(
    conn: &Connection,
    address_filter: Option<&str>,
    limit: u32,
) -> Result<Vec<AuditRow>> {
    let rows = match address_filter {
        Some(address) => {
            let key = address.trim().to_ascii_lowercase();
            let mut stmt = conn.prepare(
                "SELECT * FROM contract_audits WHERE address_key = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![key, limit], AuditRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let mut stmt =
                conn.prepare("SELECT * FROM contract_audits ORDER BY id DESC LIMIT ?1")?;
            let rows = stmt
                .query_map(params![limit], AuditRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;

    const ADDR: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";

    fn running(db: &Database) -> AuditRow {
        let address = ContractAddress::parse(ADDR).unwrap();
        db.with_conn(|conn| insert_running_audit(conn, None, &address, "sepolia"))
            .unwrap()
    }

    fn verdict() -> AuditVerdict {
        AuditVerdict {
            ai_score: 0.6123,
            risk_level: RiskLevel::Medium,
            summary: json!({"address": ADDR}),
            features: json!({"total_functions": 2}),
            details: json!({"ia_raw": {"raw": 0.456}}),
        }
    }

    #[test]
    fn test_running_audit_has_no_verdict() {
        let db = Database::open_in_memory().unwrap();
        let audit = running(&db);
        assert_eq!(audit.status, AuditStatus::Running);
        assert_eq!(audit.address, ADDR);
        assert_eq!(audit.address_key, ADDR.to_lowercase());
        assert!(audit.finished_at.is_none());
        assert!(audit.ai_score.is_none() && audit.risk_level.is_none());
    }

    #[test]
    fn test_complete_sets_score_and_level_together() {
        let db = Database::open_in_memory().unwrap();
        let audit = running(&db);
        let done = db
            .with_conn(|conn| complete_audit(conn, audit.id, &verdict()))
            .unwrap();

        assert_eq!(done.status, AuditStatus::Done);
        assert!(done.finished_at.is_some());
        assert_eq!(done.ai_score, Some(0.6123));
        assert_eq!(done.risk_level, Some(RiskLevel::Medium));
        assert_eq!(done.details.unwrap()["ia_raw"]["raw"], 0.456);
    }

    #[test]
    fn test_single_terminal_write() {
        let db = Database::open_in_memory().unwrap();
        let audit = running(&db);
        db.with_conn(|conn| fail_audit(conn, audit.id, &json!({"error": "boom"})))
            .unwrap();

        let err = db
            .with_conn(|conn| complete_audit(conn, audit.id, &verdict()))
            .unwrap_err();
        assert!(matches!(err, AuditError::Internal(_)));

        let audit = db.with_conn(|conn| get_audit(conn, audit.id)).unwrap().unwrap();
        assert_eq!(audit.status, AuditStatus::Error);
        assert!(audit.ai_score.is_none() && audit.risk_level.is_none());
        assert_eq!(audit.details.unwrap()["error"], "boom");
    }

    #[test]
    fn test_fail_running_audits_for_job() {
        let db = Database::open_in_memory().unwrap();
        let address = ContractAddress::parse(ADDR).unwrap();
        let (stuck, finished, unrelated) = db
            .with_conn(|conn| {
                let stuck = insert_running_audit(conn, Some(7), &address, "sepolia")?;
                let finished = insert_running_audit(conn, Some(7), &address, "sepolia")?;
                complete_audit(conn, finished.id, &verdict())?;
                let unrelated = insert_running_audit(conn, Some(8), &address, "sepolia")?;
                Ok((stuck, finished, unrelated))
            })
            .unwrap();

        let changed = db
            .with_conn(|conn| fail_running_audits_for_job(conn, 7, &json!({"error": "aborted"})))
            .unwrap();
        assert_eq!(changed, 1);

        let get = |id: i64| db.with_conn(|conn| get_audit(conn, id)).unwrap().unwrap();
        let stuck = get(stuck.id);
        assert_eq!(stuck.status, AuditStatus::Error);
        assert!(stuck.finished_at.is_some());
        assert!(stuck.ai_score.is_none() && stuck.risk_level.is_none());
        assert_eq!(get(finished.id).status, AuditStatus::Done);
        assert_eq!(get(unrelated.id).status, AuditStatus::Running);
    }

    #[test]
    fn test_list_newest_first_with_filter() {
        let db = Database::open_in_memory().unwrap();
        let first = running(&db);
        let second = running(&db);
        let other = ContractAddress::parse("0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359").unwrap();
        db.with_conn(|conn| insert_running_audit(conn, None, &other, "mainnet"))
            .unwrap();

        let all = db.with_conn(|conn| list_audits(conn, None, 50)).unwrap();
        assert_eq!(all.len(), 3);

        let shouted = ADDR.to_uppercase().replace("0X", "0x");
        let filtered = db
            .with_conn(|conn| list_audits(conn, Some(shouted.as_str()), 50))
            .unwrap();
        let ids: Vec<i64> = filtered.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);

        let capped = db.with_conn(|conn| list_audits(conn, None, 1)).unwrap();
        assert_eq!(capped.len(), 1);
    }
}
