//! In-process worker pool
//!
//! A fixed set of tokio tasks shares one bounded channel. Each worker runs a
//! message to completion before taking the next. Failed executions are
//! counted and logged; nothing is redelivered. A handler that panics is
//! reported back through [`TaskHandler::abandon`] and the worker keeps going.

use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{TaskHandler, TaskMessage, TaskQueue};
use crate::error::{AuditError, Result};

/// Message plus its correlation id
struct Envelope {
    task_id: String,
    message: TaskMessage,
    /// Set when the enqueuer waits for the outcome
    response_tx: Option<oneshot::Sender<Result<Value>>>,
}

/// Configuration for the worker pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker tasks
    pub worker_count: usize,
    /// Maximum queued messages
    pub max_queue_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_queue_size: 1000,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Pool counters snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolMetrics {
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub queue_depth: usize,
    pub worker_count: usize,
}

/// In-process worker pool executing task messages
pub struct WorkerPool {
    /// Taken on shutdown so workers drain and exit
    request_tx: std::sync::Mutex<Option<mpsc::Sender<Envelope>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
    worker_count: usize,
    max_queue_size: usize,
}

impl WorkerPool {
    /// Create the pool and spawn its workers
    pub fn start(config: PoolConfig, handler: Arc<dyn TaskHandler>) -> Self {
        let worker_count = config.worker_count.max(1);
        let max_queue_size = config.max_queue_size.max(1);
        let (request_tx, request_rx) = mpsc::channel::<Envelope>(max_queue_size);
        let request_rx = Arc::new(Mutex::new(request_rx));
        let counters = Arc::new(Counters::default());

        info!(
            "Starting worker pool with {} workers (queue size {})",
            worker_count, max_queue_size
        );

        let workers = (0..worker_count)
            .map(|i| {
                let request_rx = Arc::clone(&request_rx);
                let handler = Arc::clone(&handler);
                let counters = Arc::clone(&counters);
                tokio::spawn(async move {
                    worker_task(i, request_rx, handler, counters).await;
                })
            })
            .collect();

        Self {
            request_tx: std::sync::Mutex::new(Some(request_tx)),
            workers: Mutex::new(workers),
            counters,
            worker_count,
            max_queue_size,
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Envelope>> {
        self.request_tx
            .lock()
            .map_err(|e| AuditError::Internal(format!("Lock poisoned: {}", e)))?
            .clone()
            .ok_or_else(|| AuditError::Queue("Worker pool is shut down".to_string()))
    }

    async fn submit(
        &self,
        task_id: String,
        message: TaskMessage,
        response_tx: Option<oneshot::Sender<Result<Value>>>,
    ) -> Result<()> {
        let envelope = Envelope {
            task_id,
            message,
            response_tx,
        };

        self.sender()?
            .send(envelope)
            .await
            .map_err(|_| AuditError::Queue("Worker pool closed".to_string()))?;

        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Queue a message and wait for its outcome
    pub async fn enqueue_and_wait(&self, message: TaskMessage) -> Result<Value> {
        let (response_tx, response_rx) = oneshot::channel();
        self.submit(Uuid::new_v4().to_string(), message, Some(response_tx))
            .await?;
        response_rx
            .await
            .map_err(|_| AuditError::Queue("Response channel closed".to_string()))?
    }

    /// Current counters
    pub fn metrics(&self) -> PoolMetrics {
        let queue_depth = self
            .sender()
            .map(|tx| self.max_queue_size - tx.capacity())
            .unwrap_or(0);
        PoolMetrics {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            queue_depth,
            worker_count: self.worker_count,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Stop accepting messages, let workers drain the queue, and wait for them
    pub async fn shutdown(&self) {
        if let Ok(mut tx) = self.request_tx.lock() {
            tx.take();
        }
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            if let Err(e) = worker.await {
                error!("Worker task panicked: {}", e);
            }
        }
        info!("Worker pool stopped");
    }
}

#[async_trait::async_trait]
impl TaskQueue for WorkerPool {
    async fn enqueue(&self, task_id: &str, message: TaskMessage) -> Result<()> {
        debug!(task = message.name(), job_id = message.job_id(), task_id, "Enqueueing task");
        self.submit(task_id.to_string(), message, None).await
    }
}

/// Worker task that processes messages from the pool
async fn worker_task(
    worker_id: usize,
    request_rx: Arc<Mutex<mpsc::Receiver<Envelope>>>,
    handler: Arc<dyn TaskHandler>,
    counters: Arc<Counters>,
) {
    debug!("Worker {} started", worker_id);

    loop {
        let envelope = {
            let mut rx = request_rx.lock().await;
            match rx.recv().await {
                Some(envelope) => envelope,
                None => {
                    debug!("Worker {} shutting down (channel closed)", worker_id);
                    return;
                }
            }
        };

        let task = envelope.message.name();
        let job_id = envelope.message.job_id();
        debug!(worker_id, task, job_id, task_id = %envelope.task_id, "Processing task");

        let result = run_contained(Arc::clone(&handler), envelope.message).await;

        match &result {
            Ok(_) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
                info!(worker_id, task, job_id, task_id = %envelope.task_id, "Task succeeded");
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(worker_id, task, job_id, task_id = %envelope.task_id, error = %e, "Task failed");
            }
        }

        if let Some(response_tx) = envelope.response_tx {
            let _ = response_tx.send(result);
        }
    }
}

/// Run one message on its own task so a handler panic cannot take the
/// worker down with it
async fn run_contained(handler: Arc<dyn TaskHandler>, message: TaskMessage) -> Result<Value> {
    let job_id = message.job_id();
    let task = message.name();
    let runner = Arc::clone(&handler);

    match tokio::spawn(async move { runner.handle(message).await }).await {
        Ok(result) => result,
        Err(join_error) => {
            let cause = if join_error.is_panic() {
                AuditError::Internal(format!("{task} handler panicked: {}", panic_message(join_error)))
            } else {
                AuditError::Internal(format!("{task} handler was cancelled"))
            };
            error!(task, job_id, error = %cause, "Task aborted");
            handler.abandon(job_id, &cause).await;
            Err(cause)
        }
    }
}

fn panic_message(join_error: tokio::task::JoinError) -> String {
    let payload = join_error.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
