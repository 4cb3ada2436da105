//! Task queue
//!
//! Messages reference a persisted Job by id; the job row carries the state,
//! the message only says which handler to run.
//!
//! ```text
//! AuditService::enqueue_*  →  TaskQueue::enqueue  →  WorkerPool worker
//!                                                        ↓
//!                                                   TaskHandler::handle
//! ```

pub mod pool;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AuditError, Result};

pub use pool::{PoolConfig, PoolMetrics, WorkerPool};

pub const TASK_AUDIT_RUN: &str = "audit.run";
pub const TASK_AI_PREDICT: &str = "ai.predict";
pub const TASK_AWAIT_RECEIPT: &str = "tx.await_receipt";

/// A unit of queued work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task")]
pub enum TaskMessage {
    #[serde(rename = "audit.run")]
    AuditRun {
        job_id: i64,
        address: String,
        network: String,
        #[serde(default)]
        force_refresh: bool,
    },
    #[serde(rename = "ai.predict")]
    AiPredict { job_id: i64 },
    #[serde(rename = "tx.await_receipt")]
    AwaitReceipt { job_id: i64, tx_hash: String },
}

impl TaskMessage {
    pub fn name(&self) -> &'static str {
        match self {
            TaskMessage::AuditRun { .. } => TASK_AUDIT_RUN,
            TaskMessage::AiPredict { .. } => TASK_AI_PREDICT,
            TaskMessage::AwaitReceipt { .. } => TASK_AWAIT_RECEIPT,
        }
    }

    pub fn job_id(&self) -> i64 {
        match self {
            TaskMessage::AuditRun { job_id, .. }
            | TaskMessage::AiPredict { job_id }
            | TaskMessage::AwaitReceipt { job_id, .. } => *job_id,
        }
    }
}

/// Enqueue side of the task queue
#[async_trait::async_trait]
pub trait TaskQueue: Send + Sync {
    /// Queue a message under a caller-assigned correlation id
    async fn enqueue(&self, task_id: &str, message: TaskMessage) -> Result<()>;
}

/// Executes dequeued messages
///
/// An `Err` marks the execution failed; the handler has already recorded
/// the failure on the job before returning it.
#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, message: TaskMessage) -> Result<Value>;

    /// Called when `handle` panicked or was cancelled for `job_id`, so the
    /// handler can close out whatever it left running
    async fn abandon(&self, _job_id: i64, _cause: &AuditError) {}
}
