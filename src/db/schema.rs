//! Database schema definitions

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::error::Result;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        conn.execute_batch(JOBS_SCHEMA)?;
        conn.execute_batch(AUDITS_SCHEMA)?;
        conn.execute_batch(ABI_CACHE_SCHEMA)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!(
            "Migrating schema from v{} to v{}",
            current_version, SCHEMA_VERSION
        );
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;

    let version = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()?;

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

const JOBS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS analysis_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT UNIQUE,
    kind TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'queued',
    params TEXT,
    result TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS ix_analysis_jobs_status ON analysis_jobs(status);
CREATE INDEX IF NOT EXISTS ix_analysis_jobs_created_at ON analysis_jobs(created_at);
"#;

const AUDITS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS contract_audits (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER REFERENCES analysis_jobs(id),
    address TEXT NOT NULL,
    address_key TEXT NOT NULL,
    network TEXT NOT NULL DEFAULT 'sepolia',

    -- queued | running | done | error
    status TEXT NOT NULL DEFAULT 'running',
    started_at TEXT NOT NULL,
    finished_at TEXT,

    -- score and level are written together or not at all
    ai_score REAL,
    risk_level TEXT,
    summary TEXT,
    features TEXT,
    details TEXT
);

CREATE INDEX IF NOT EXISTS ix_contract_audits_address_key ON contract_audits(address_key);
CREATE INDEX IF NOT EXISTS ix_contract_audits_network ON contract_audits(network);
"#;

const ABI_CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS contract_abis (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    -- checksum-validated, stored lowercase for case-insensitive lookup
    address TEXT NOT NULL,
    network TEXT NOT NULL DEFAULT 'sepolia',
    source TEXT NOT NULL,
    abi TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    CONSTRAINT uq_contract_abis_address_network UNIQUE (address, network)
);

CREATE INDEX IF NOT EXISTS ix_contract_abis_address ON contract_abis(address);
CREATE INDEX IF NOT EXISTS ix_contract_abis_network ON contract_abis(network);
"#;
