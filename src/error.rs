//! Error types for contract-auditor

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("ABI unresolved for {address} on {network}")]
    AbiUnresolved { address: String, network: String },

    #[error("ABI fetch error: {0}")]
    AbiFetch(String),

    #[error("ABI parse error: {0}")]
    AbiParse(String),

    #[error("Job not found: {0}")]
    JobNotFound(i64),

    #[error("Audit not found: {0}")]
    AuditNotFound(i64),

    #[error("Invalid status transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: i64,
        from: String,
        to: String,
    },

    #[error("Scorer error: {0}")]
    Scorer(String),

    #[error("Timed out after {secs}s: {operation}")]
    Timeout { operation: String, secs: u64 },

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuditError {
    /// Whether the error was raised by local input validation.
    ///
    /// Validation failures are reported to the caller immediately and are
    /// never worth redelivering.
    pub fn is_validation(&self) -> bool {
        matches!(self, AuditError::InvalidAddress(_))
    }
}

pub type Result<T> = std::result::Result<T, AuditError>;
