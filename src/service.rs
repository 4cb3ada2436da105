//! Audit service facade
//!
//! The operations the web layer calls: create jobs and enqueue them, read
//! jobs and audits back, register ABIs by hand, and score feature pairs.

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::abi::{normalize_payload, AbiCacheRecord, AbiCacheStore, Provenance};
use crate::address::ContractAddress;
use crate::db::audits::{self, AuditRow};
use crate::db::jobs::{self, JobRow, JobStatus, NewJob};
use crate::db::Database;
use crate::error::{AuditError, Result};
use crate::queue::{TaskMessage, TaskQueue, TASK_AI_PREDICT, TASK_AUDIT_RUN, TASK_AWAIT_RECEIPT};
use crate::scoring::{RiskAssessment, RiskScorer, ScoreInput};

/// Most audits returned by one listing
pub const LIST_LIMIT: u32 = 50;

/// Acknowledgement for a queued job
#[derive(Debug, Clone, Serialize)]
pub struct EnqueuedJob {
    pub job_id: i64,
    pub task_id: String,
    pub status: JobStatus,
}

pub struct AuditService {
    db: Arc<Database>,
    queue: Arc<dyn TaskQueue>,
    cache: AbiCacheStore,
    scorer: RiskScorer,
}

impl AuditService {
    pub fn new(db: Arc<Database>, queue: Arc<dyn TaskQueue>, scorer: RiskScorer) -> Self {
        let cache = AbiCacheStore::new(Arc::clone(&db));
        Self {
            db,
            queue,
            cache,
            scorer,
        }
    }

    /// Create an audit job and queue it.
    ///
    /// A malformed address is rejected here; no job is created for it.
    pub async fn enqueue_audit(
        &self,
        address: &str,
        network: &str,
        force_refresh: bool,
    ) -> Result<EnqueuedJob> {
        let address = ContractAddress::parse(address)?;
        let network = network.trim().to_ascii_lowercase();

        let job = self.create_job(
            TASK_AUDIT_RUN,
            json!({
                "address": address.checksum(),
                "network": network,
                "force_refresh": force_refresh,
            }),
        )?;

        self.dispatch(
            job,
            TaskMessage::AuditRun {
                job_id: 0,
                address: address.checksum().to_string(),
                network,
                force_refresh,
            },
        )
        .await
    }

    /// Create a prediction job for `{feature1, feature2}` params
    pub async fn enqueue_prediction(&self, params: Value) -> Result<EnqueuedJob> {
        let job = self.create_job(TASK_AI_PREDICT, params)?;
        self.dispatch(job, TaskMessage::AiPredict { job_id: 0 }).await
    }

    /// Create a job that waits for an already broadcast transaction
    pub async fn enqueue_receipt_wait(&self, tx_hash: &str) -> Result<EnqueuedJob> {
        let tx_hash = tx_hash.trim().to_string();
        let job = self.create_job(TASK_AWAIT_RECEIPT, json!({ "tx_hash": tx_hash }))?;
        self.dispatch(job, TaskMessage::AwaitReceipt { job_id: 0, tx_hash })
            .await
    }

    /// Insert a queued job that already carries its task id
    fn create_job(&self, kind: &str, params: Value) -> Result<JobRow> {
        self.db.with_conn(|conn| {
            jobs::insert_job(
                conn,
                &NewJob {
                    kind: kind.to_string(),
                    params,
                    task_id: Some(Uuid::new_v4().to_string()),
                },
            )
        })
    }

    /// Point the message at the new job and queue it.
    ///
    /// The job row is not written after a successful enqueue; a worker may
    /// already own it. If the queue refuses the message the job is marked
    /// error.
    async fn dispatch(&self, job: JobRow, mut message: TaskMessage) -> Result<EnqueuedJob> {
        match &mut message {
            TaskMessage::AuditRun { job_id, .. }
            | TaskMessage::AiPredict { job_id }
            | TaskMessage::AwaitReceipt { job_id, .. } => *job_id = job.id,
        }
        let task = message.name();
        let task_id = job
            .task_id
            .clone()
            .ok_or_else(|| AuditError::Internal(format!("job {} has no task id", job.id)))?;

        if let Err(e) = self.queue.enqueue(&task_id, message).await {
            error!(job_id = job.id, task, error = %e, "Failed to enqueue job");
            let result = json!({ "error": e.to_string() });
            if let Err(mark) = self.db.with_conn(|conn| {
                jobs::transition_job(conn, job.id, JobStatus::Error, Some(&result))
            }) {
                error!(job_id = job.id, error = %mark, "Failed to record enqueue error");
            }
            return Err(e);
        }

        info!(job_id = job.id, task, task_id = %task_id, "Job queued");

        Ok(EnqueuedJob {
            job_id: job.id,
            task_id,
            status: JobStatus::Queued,
        })
    }

    /// Job status and result
    pub fn job_status(&self, job_id: i64) -> Result<JobRow> {
        self.db
            .with_conn(|conn| jobs::get_job(conn, job_id))?
            .ok_or(AuditError::JobNotFound(job_id))
    }

    /// Full audit record
    pub fn get_audit(&self, audit_id: i64) -> Result<AuditRow> {
        self.db
            .with_conn(|conn| audits::get_audit(conn, audit_id))?
            .ok_or(AuditError::AuditNotFound(audit_id))
    }

    /// Most recent audits, newest first, optionally for one address
    pub fn list_audits(&self, address: Option<&str>) -> Result<Vec<AuditRow>> {
        let filter = address.map(str::trim).filter(|a| !a.is_empty());
        self.db
            .with_conn(|conn| audits::list_audits(conn, filter, LIST_LIMIT))
    }

    /// Store a hand-supplied ABI with provenance `manual`
    pub fn register_abi(&self, address: &str, network: &str, abi: &Value) -> Result<AbiCacheRecord> {
        let definition = normalize_payload(abi)?;
        let record = self
            .cache
            .upsert(address, network, &definition, Provenance::Manual)?;
        info!(
            address = %record.address,
            network = %record.network,
            functions = record.abi.len(),
            "ABI registered"
        );
        Ok(record)
    }

    /// Score `{feature1, feature2}` synchronously
    pub fn predict(&self, params: &Value) -> Result<RiskAssessment> {
        self.scorer.score(ScoreInput::from_params(params)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::mock::FixedOracle;
    use std::sync::Mutex;

    /// Queue that records messages, or refuses them
    #[derive(Default)]
    struct RecordingQueue {
        refuse: bool,
        messages: Mutex<Vec<(String, TaskMessage)>>,
    }

    #[async_trait::async_trait]
    impl TaskQueue for RecordingQueue {
        async fn enqueue(&self, task_id: &str, message: TaskMessage) -> Result<()> {
            if self.refuse {
                return Err(AuditError::Queue("broker unavailable".to_string()));
            }
            self.messages
                .lock()
                .unwrap()
                .push((task_id.to_string(), message));
            Ok(())
        }
    }

    /// Queue whose "worker" finishes the job before enqueue returns
    struct InstantQueue {
        db: Arc<Database>,
        finished: Mutex<Option<JobRow>>,
    }

    #[async_trait::async_trait]
    impl TaskQueue for InstantQueue {
        async fn enqueue(&self, _task_id: &str, message: TaskMessage) -> Result<()> {
            let job_id = message.job_id();
            let done = self.db.with_conn(|conn| {
                jobs::transition_job(conn, job_id, JobStatus::Running, None)?;
                jobs::transition_job(conn, job_id, JobStatus::Done, Some(&json!({"risk_score": 0.5})))
            })?;
            *self.finished.lock().unwrap() = Some(done);
            Ok(())
        }
    }

    fn service(queue: Arc<RecordingQueue>) -> (AuditService, Arc<Database>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let service = AuditService::new(
            Arc::clone(&db),
            queue,
            RiskScorer::new(Arc::new(FixedOracle(-0.2))),
        );
        (service, db)
    }

    #[tokio::test]
    async fn test_enqueue_audit() {
        let queue = Arc::new(RecordingQueue::default());
        let (service, _db) = service(Arc::clone(&queue));

        let ack = service
            .enqueue_audit("0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed", "Sepolia", true)
            .await
            .unwrap();
        assert!(Uuid::parse_str(&ack.task_id).is_ok());
        assert_eq!(ack.status, JobStatus::Queued);

        let job = service.job_status(ack.job_id).unwrap();
        assert_eq!(job.task_id.as_deref(), Some(ack.task_id.as_str()));
        assert_eq!(job.kind, "audit.run");
        assert_eq!(job.params.unwrap()["network"], "sepolia");

        let messages = queue.messages.lock().unwrap();
        assert_eq!(messages[0].0, ack.task_id);
        assert_eq!(
            messages[0].1,
            TaskMessage::AuditRun {
                job_id: ack.job_id,
                address: "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed".to_string(),
                network: "sepolia".to_string(),
                force_refresh: true,
            }
        );
    }

    #[tokio::test]
    async fn test_job_finished_during_enqueue_is_left_untouched() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let queue = Arc::new(InstantQueue {
            db: Arc::clone(&db),
            finished: Mutex::new(None),
        });
        let service = AuditService::new(
            Arc::clone(&db),
            queue.clone(),
            RiskScorer::new(Arc::new(FixedOracle(-0.2))),
        );

        let ack = service
            .enqueue_prediction(json!({"feature1": 0.1, "feature2": 0}))
            .await
            .unwrap();

        let finished = queue.finished.lock().unwrap().clone().unwrap();
        let job = service.job_status(ack.job_id).unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.updated_at, finished.updated_at);
        assert_eq!(job.result, finished.result);
        assert_eq!(job.task_id.as_deref(), Some(ack.task_id.as_str()));
    }

    #[tokio::test]
    async fn test_invalid_address_creates_no_job() {
        let queue = Arc::new(RecordingQueue::default());
        let (service, _db) = service(Arc::clone(&queue));

        let err = service.enqueue_audit("0x123", "sepolia", false).await.unwrap_err();
        assert!(err.is_validation());
        assert!(matches!(service.job_status(1), Err(AuditError::JobNotFound(1))));
        assert!(queue.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refused_enqueue_marks_job_error() {
        let queue = Arc::new(RecordingQueue {
            refuse: true,
            ..Default::default()
        });
        let (service, _db) = service(queue);

        let err = service
            .enqueue_prediction(json!({"feature1": 1.0}))
            .await
            .unwrap_err();
        assert!(matches!(err, AuditError::Queue(_)));

        let job = service.job_status(1).unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.result.unwrap()["error"]
            .as_str()
            .unwrap()
            .contains("broker unavailable"));
    }

    #[tokio::test]
    async fn test_register_abi_and_predict() {
        let (service, _db) = service(Arc::new(RecordingQueue::default()));
        let record = service
            .register_abi(
                "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed",
                "sepolia",
                &json!("[{\"type\":\"function\",\"name\":\"owner\",\"stateMutability\":\"view\"}]"),
            )
            .unwrap();
        assert_eq!(record.provenance, Provenance::Manual);
        assert_eq!(record.abi[0].name(), "owner");

        assert!(matches!(
            service.register_abi("0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed", "sepolia", &json!(42)),
            Err(AuditError::AbiParse(_))
        ));

        let assessment = service.predict(&json!({"feature1": 0.1, "feature2": 0})).unwrap();
        assert_eq!(assessment.raw, 0.2);
        assert_eq!(assessment.risk_score, 0.5498);
    }

    #[tokio::test]
    async fn test_reads_report_missing_records() {
        let (service, _db) = service(Arc::new(RecordingQueue::default()));
        assert!(matches!(service.get_audit(4), Err(AuditError::AuditNotFound(4))));
        assert!(service.list_audits(Some("  ")).unwrap().is_empty());
    }
}
