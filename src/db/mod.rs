//! SQLite persistence for jobs, audits and the ABI cache
//!
//! ## Tables
//!
//! - `analysis_jobs` - queued units of work and their results
//! - `contract_audits` - one row per audit attempt
//! - `contract_abis` - cached interface definitions, UNIQUE(address, network)
//!
//! JSON payloads are stored as TEXT; timestamps as chrono UTC datetimes.

pub mod audits;
pub mod jobs;
pub mod schema;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{AuditError, Result};

/// SQLite database shared by every pipeline component
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database file
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        info!("Opening SQLite database at {:?}", path);
        let conn = Connection::open(path)?;

        // WAL lets status readers proceed while a worker writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        debug!("Opening in-memory SQLite database");
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        self.with_conn(schema::init_schema)
    }

    /// Run a closure against the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| AuditError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }
}

/// Serialize a JSON payload for a TEXT column
pub(crate) fn to_json_text(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Read an optional JSON TEXT column
pub(crate) fn json_column(row: &Row, column: &str) -> rusqlite::Result<Option<Value>> {
    let raw: Option<String> = row.get(column)?;
    raw.map(|text| {
        serde_json::from_str(&text).map_err(|e| {
            let index = row.as_ref().column_index(column).unwrap_or(0);
            rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e))
        })
    })
    .transpose()
}

/// Read a TEXT column through `FromStr`
pub(crate) fn parsed_column<T>(row: &Row, column: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(column)?;
    raw.parse::<T>().map_err(|e| {
        let index = row.as_ref().column_index(column).unwrap_or(0);
        rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e))
    })
}
