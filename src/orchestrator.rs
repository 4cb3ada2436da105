//! Job/Audit orchestration
//!
//! ```text
//! Job:   queued → running → done | error
//!                    ↘ pending → done | error      (receipt waits)
//! Audit: running → done | error
//! ```
//!
//! The orchestrator owns every Job and Audit transition during one
//! execution. A failure after the Audit exists is written to both records
//! and then returned to the queue layer.

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::abi::{AbiResolver, ResolveOptions};
use crate::address::ContractAddress;
use crate::chain::{wait_for_receipt, ReceiptConfig, ReceiptSource};
use crate::db::audits::{self, AuditRow, AuditVerdict};
use crate::db::jobs::{self, JobRow, JobStatus};
use crate::db::Database;
use crate::error::{AuditError, Result};
use crate::features::FeatureExtractor;
use crate::queue::{TaskHandler, TaskMessage};
use crate::scoring::{RiskLevel, RiskScorer, ScoreInput};

/// Result summary written to a finished audit job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditOutcome {
    pub audit_id: i64,
    pub ai_score: f64,
    pub risk_level: RiskLevel,
}

/// Runs audit, prediction and receipt-wait jobs
pub struct AuditOrchestrator {
    db: Arc<Database>,
    resolver: Arc<AbiResolver>,
    extractor: Arc<FeatureExtractor>,
    scorer: RiskScorer,
    receipts: Option<Arc<dyn ReceiptSource>>,
    receipt_config: ReceiptConfig,
}

impl AuditOrchestrator {
    pub fn new(
        db: Arc<Database>,
        resolver: Arc<AbiResolver>,
        extractor: Arc<FeatureExtractor>,
        scorer: RiskScorer,
    ) -> Self {
        Self {
            db,
            resolver,
            extractor,
            scorer,
            receipts: None,
            receipt_config: ReceiptConfig::default(),
        }
    }

    /// Enable `tx.await_receipt` jobs
    pub fn with_receipts(mut self, source: Arc<dyn ReceiptSource>, config: ReceiptConfig) -> Self {
        self.receipts = Some(source);
        self.receipt_config = config;
        self
    }

    // =========================================================================
    // Audit
    // =========================================================================

    /// Execute one audit job.
    pub async fn run_audit(
        &self,
        job_id: i64,
        address: &str,
        network: &str,
        force_refresh: bool,
    ) -> Result<AuditOutcome> {
        self.start_job(job_id)?;

        let address = match ContractAddress::parse(address) {
            Ok(address) => address,
            Err(e) => {
                warn!(job_id, error = %e, "Rejecting audit with invalid address");
                self.fail_job(job_id, &e);
                return Err(e);
            }
        };
        let network = network.trim().to_ascii_lowercase();

        let audit = self
            .db
            .with_conn(|conn| audits::insert_running_audit(conn, Some(job_id), &address, &network))
            .inspect_err(|e| self.fail_job(job_id, e))?;

        info!(job_id, audit_id = audit.id, address = %address, network = %network, "Audit started");

        match self
            .audit_steps(job_id, &audit, &address, &network, force_refresh)
            .await
        {
            Ok(outcome) => {
                info!(
                    job_id,
                    audit_id = outcome.audit_id,
                    ai_score = outcome.ai_score,
                    risk_level = %outcome.risk_level,
                    "Audit done"
                );
                Ok(outcome)
            }
            Err(e) => {
                error!(job_id, audit_id = audit.id, error = %e, "Audit failed");
                self.fail_audit(audit.id, &e);
                self.fail_job(job_id, &e);
                Err(e)
            }
        }
    }

    async fn audit_steps(
        &self,
        job_id: i64,
        audit: &AuditRow,
        address: &ContractAddress,
        network: &str,
        force_refresh: bool,
    ) -> Result<AuditOutcome> {
        let resolved = self
            .resolver
            .resolve(address, network, &ResolveOptions::refresh(force_refresh))
            .await?;

        let features = self.extractor.extract(address, &resolved.abi).await?;
        let assessment = self.scorer.score(features.score_input())?;

        let verdict = AuditVerdict {
            ai_score: assessment.risk_score,
            risk_level: assessment.level,
            summary: json!({
                "address": address.checksum(),
                "network": network,
                "name": features.name,
                "symbol": features.symbol,
                "decimals": features.decimals,
                "code_len": features.code_len,
                "total_functions": features.total_functions,
            }),
            features: serde_json::to_value(&features)?,
            details: json!({ "ia_raw": assessment }),
        };

        self.db
            .with_conn(|conn| audits::complete_audit(conn, audit.id, &verdict))?;

        let outcome = AuditOutcome {
            audit_id: audit.id,
            ai_score: assessment.risk_score,
            risk_level: assessment.level,
        };
        self.db.with_conn(|conn| {
            jobs::transition_job(conn, job_id, JobStatus::Done, Some(&serde_json::to_value(&outcome)?))
        })?;

        Ok(outcome)
    }

    // =========================================================================
    // Prediction
    // =========================================================================

    /// Score a job's `{feature1, feature2}` parameters
    pub async fn run_prediction(&self, job_id: i64) -> Result<Value> {
        let job = self.start_job(job_id)?;

        let result = ScoreInput::from_params(job.params.as_ref().unwrap_or(&Value::Null))
            .and_then(|input| self.scorer.score(input))
            .and_then(|assessment| Ok(serde_json::to_value(assessment)?))
            .and_then(|result| {
                self.db
                    .with_conn(|conn| jobs::transition_job(conn, job_id, JobStatus::Done, Some(&result)))?;
                Ok(result)
            });

        if let Err(e) = &result {
            error!(job_id, error = %e, "Prediction failed");
            self.fail_job(job_id, e);
        }
        result
    }

    // =========================================================================
    // Receipt wait
    // =========================================================================

    /// Wait for a broadcast transaction to be mined.
    ///
    /// The job sits in `pending` with the hash while waiting; a timeout
    /// moves it to `error`.
    pub async fn await_receipt(&self, job_id: i64, tx_hash: &str) -> Result<Value> {
        self.start_job(job_id)?;

        let result = self.receipt_steps(job_id, tx_hash).await;
        if let Err(e) = &result {
            error!(job_id, tx_hash, error = %e, "Receipt wait failed");
            self.fail_job(job_id, e);
        }
        result
    }

    async fn receipt_steps(&self, job_id: i64, tx_hash: &str) -> Result<Value> {
        let source = self
            .receipts
            .as_ref()
            .ok_or_else(|| AuditError::Config("no receipt source configured".to_string()))?;

        self.db.with_conn(|conn| {
            jobs::transition_job(conn, job_id, JobStatus::Pending, Some(&json!({"tx_hash": tx_hash})))
        })?;

        let receipt = wait_for_receipt(source.as_ref(), tx_hash, &self.receipt_config).await?;

        self.db.with_conn(|conn| {
            jobs::transition_job(
                conn,
                job_id,
                JobStatus::Done,
                Some(&json!({"tx_hash": tx_hash, "receipt": receipt})),
            )
        })?;

        info!(job_id, tx_hash, "Transaction mined");
        Ok(json!({"tx_hash": tx_hash, "status": "mined"}))
    }

    // =========================================================================
    // Job bookkeeping
    // =========================================================================

    /// Load a job and move it to running.
    ///
    /// A job already running is a redelivery and stays running; a finished
    /// or pending job is rejected without side effects.
    fn start_job(&self, job_id: i64) -> Result<JobRow> {
        self.db.with_conn(|conn| {
            let job = jobs::get_job(conn, job_id)?.ok_or(AuditError::JobNotFound(job_id))?;
            match job.status {
                JobStatus::Queued => jobs::transition_job(conn, job_id, JobStatus::Running, None),
                JobStatus::Running => {
                    warn!(job_id, "Job already running, treating as redelivery");
                    Ok(job)
                }
                status => Err(AuditError::InvalidTransition {
                    job_id,
                    from: status.to_string(),
                    to: JobStatus::Running.to_string(),
                }),
            }
        })
    }

    /// Record a failure on the job; secondary write errors are only logged
    fn fail_job(&self, job_id: i64, cause: &AuditError) {
        let result = json!({"error": cause.to_string()});
        if let Err(e) = self
            .db
            .with_conn(|conn| jobs::transition_job(conn, job_id, JobStatus::Error, Some(&result)))
        {
            error!(job_id, error = %e, "Failed to record job error");
        }
    }

    fn fail_audit(&self, audit_id: i64, cause: &AuditError) {
        let details = json!({"error": cause.to_string()});
        if let Err(e) = self
            .db
            .with_conn(|conn| audits::fail_audit(conn, audit_id, &details))
        {
            error!(audit_id, error = %e, "Failed to record audit error");
        }
    }
}

#[async_trait::async_trait]
impl TaskHandler for AuditOrchestrator {
    async fn handle(&self, message: TaskMessage) -> Result<Value> {
        match message {
            TaskMessage::AuditRun {
                job_id,
                address,
                network,
                force_refresh,
            } => {
                let outcome = self.run_audit(job_id, &address, &network, force_refresh).await?;
                Ok(json!({
                    "ok": true,
                    "audit_id": outcome.audit_id,
                    "ai_score": outcome.ai_score,
                    "risk_level": outcome.risk_level,
                }))
            }
            TaskMessage::AiPredict { job_id } => self.run_prediction(job_id).await,
            TaskMessage::AwaitReceipt { job_id, tx_hash } => {
                self.await_receipt(job_id, &tx_hash).await
            }
        }
    }

    /// Close out a job whose execution died mid-flight
    async fn abandon(&self, job_id: i64, cause: &AuditError) {
        let details = json!({"error": cause.to_string()});
        match self
            .db
            .with_conn(|conn| audits::fail_running_audits_for_job(conn, job_id, &details))
        {
            Ok(0) => {}
            Ok(count) => warn!(job_id, count, "Failed audits left running by an aborted task"),
            Err(e) => error!(job_id, error = %e, "Failed to record audit error"),
        }
        self.fail_job(job_id, cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::resolver::mock::MockRegistry;
    use crate::abi::{AbiCacheStore, AbiRegistry};
    use crate::chain::mock::{MockProbe, MockReceipts};
    use crate::chain::AbiValue;
    use crate::db::audits::AuditStatus;
    use crate::db::jobs::NewJob;
    use crate::scoring::mock::FixedOracle;
    use std::time::Duration;

    const ADDR: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";

    fn registry_payload() -> Value {
        json!(json!([
            {"type": "function", "name": "mint", "stateMutability": "nonpayable", "inputs": [], "outputs": []},
            {"type": "function", "name": "name", "stateMutability": "view", "inputs": [],
             "outputs": [{"name": "", "type": "string"}]}
        ])
        .to_string())
    }

    fn orchestrator(
        db: &Arc<Database>,
        registry: Arc<MockRegistry>,
        probe: MockProbe,
    ) -> AuditOrchestrator {
        orchestrator_with_oracle(db, registry, probe, -0.9)
    }

    fn orchestrator_with_oracle(
        db: &Arc<Database>,
        registry: Arc<MockRegistry>,
        probe: MockProbe,
        magnitude: f64,
    ) -> AuditOrchestrator {
        let resolver = AbiResolver::new(
            AbiCacheStore::new(Arc::clone(db)),
            Some(registry as Arc<dyn AbiRegistry>),
        );
        AuditOrchestrator::new(
            Arc::clone(db),
            Arc::new(resolver),
            Arc::new(FeatureExtractor::new(Arc::new(probe))),
            RiskScorer::new(Arc::new(FixedOracle(magnitude))),
        )
    }

    fn queued_job(db: &Database, kind: &str, params: Value) -> i64 {
        db.with_conn(|conn| {
            jobs::insert_job(
                conn,
                &NewJob {
                    kind: kind.to_string(),
                    params,
                    task_id: None,
                },
            )
        })
        .unwrap()
        .id
    }

    fn job(db: &Database, id: i64) -> JobRow {
        db.with_conn(|conn| jobs::get_job(conn, id)).unwrap().unwrap()
    }

    fn all_audits(db: &Database) -> Vec<AuditRow> {
        db.with_conn(|conn| audits::list_audits(conn, None, 50)).unwrap()
    }

    #[tokio::test]
    async fn test_happy_path() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let probe = MockProbe::with_code(120).value("name", AbiValue::String("Token".into()));
        let orch = orchestrator(&db, MockRegistry::returning(registry_payload()), probe);
        let job_id = queued_job(&db, "audit.run", json!({}));

        let outcome = orch.run_audit(job_id, ADDR, "sepolia", false).await.unwrap();

        // sigmoid(0.9) rounded
        assert_eq!(outcome.ai_score, 0.7109);
        assert_eq!(outcome.risk_level, RiskLevel::High);

        let audit = db
            .with_conn(|conn| audits::get_audit(conn, outcome.audit_id))
            .unwrap()
            .unwrap();
        assert_eq!(audit.status, AuditStatus::Done);
        assert_eq!(audit.job_id, Some(job_id));
        assert!(audit.finished_at.is_some());
        let features = audit.features.unwrap();
        assert_eq!(features["total_functions"], 2);
        assert_eq!(features["write_ratio"], 0.5);
        assert_eq!(features["name"], "Token");
        assert_eq!(audit.summary.unwrap()["code_len"], 120);
        assert_eq!(audit.details.unwrap()["ia_raw"]["raw"], 0.9);

        let job = job(&db, job_id);
        assert_eq!(job.status, JobStatus::Done);
        let result = job.result.unwrap();
        assert_eq!(result["audit_id"], outcome.audit_id);
        assert_eq!(result["risk_level"], "high");
    }

    #[tokio::test]
    async fn test_resolution_failure_marks_both_records() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let orch = orchestrator(&db, MockRegistry::failing(), MockProbe::with_code(120));
        let job_id = queued_job(&db, "audit.run", json!({}));

        let err = orch.run_audit(job_id, ADDR, "sepolia", false).await.unwrap_err();
        assert!(matches!(err, AuditError::AbiFetch(_)));

        let audits = all_audits(&db);
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].status, AuditStatus::Error);
        assert!(audits[0].finished_at.is_some());
        assert!(audits[0].ai_score.is_none() && audits[0].risk_level.is_none());
        assert!(audits[0].details.as_ref().unwrap()["error"]
            .as_str()
            .unwrap()
            .contains("ETHERSCAN_API_KEY"));

        let job = job(&db, job_id);
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.result.unwrap()["error"].is_string());
    }

    #[tokio::test]
    async fn test_scorer_failure_marks_both_records() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let orch = orchestrator_with_oracle(
            &db,
            MockRegistry::returning(registry_payload()),
            MockProbe::with_code(120),
            f64::NAN,
        );
        let job_id = queued_job(&db, "audit.run", json!({}));

        let err = orch.run_audit(job_id, ADDR, "sepolia", false).await.unwrap_err();
        assert!(matches!(err, AuditError::Scorer(_)));

        let audits = all_audits(&db);
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].status, AuditStatus::Error);
        assert!(audits[0].finished_at.is_some());
        assert!(audits[0].ai_score.is_none() && audits[0].risk_level.is_none());
        assert!(audits[0].details.as_ref().unwrap()["error"]
            .as_str()
            .unwrap()
            .contains("non-finite"));

        let job = job(&db, job_id);
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.result.unwrap()["error"].is_string());
    }

    #[tokio::test]
    async fn test_abandon_closes_running_records() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let orch = orchestrator(&db, MockRegistry::failing(), MockProbe::default());
        let job_id = queued_job(&db, "audit.run", json!({}));
        let address = ContractAddress::parse(ADDR).unwrap();
        let audit = db
            .with_conn(|conn| {
                jobs::transition_job(conn, job_id, JobStatus::Running, None)?;
                audits::insert_running_audit(conn, Some(job_id), &address, "sepolia")
            })
            .unwrap();

        let cause = AuditError::Internal("audit.run handler panicked".to_string());
        orch.abandon(job_id, &cause).await;

        let audit = db
            .with_conn(|conn| audits::get_audit(conn, audit.id))
            .unwrap()
            .unwrap();
        assert_eq!(audit.status, AuditStatus::Error);
        assert!(audit.finished_at.is_some());
        let job = job(&db, job_id);
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.result.unwrap()["error"].as_str().unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn test_missing_job_creates_no_audit() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let orch = orchestrator(&db, MockRegistry::returning(registry_payload()), MockProbe::with_code(1));

        let err = orch.run_audit(99, ADDR, "sepolia", false).await.unwrap_err();
        assert!(matches!(err, AuditError::JobNotFound(99)));
        assert!(all_audits(&db).is_empty());
    }

    #[tokio::test]
    async fn test_invalid_address_fails_job_without_audit() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let orch = orchestrator(&db, MockRegistry::returning(registry_payload()), MockProbe::with_code(1));
        let job_id = queued_job(&db, "audit.run", json!({}));

        let err = orch.run_audit(job_id, "0xnope", "sepolia", false).await.unwrap_err();
        assert!(err.is_validation());
        assert!(all_audits(&db).is_empty());
        assert_eq!(job(&db, job_id).status, JobStatus::Error);
    }

    #[tokio::test]
    async fn test_redelivery_rules() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let orch = orchestrator(&db, MockRegistry::returning(registry_payload()), MockProbe::with_code(1));

        // a job left running by a crashed worker re-executes
        let crashed = queued_job(&db, "audit.run", json!({}));
        db.with_conn(|conn| jobs::transition_job(conn, crashed, JobStatus::Running, None))
            .unwrap();
        orch.run_audit(crashed, ADDR, "sepolia", false).await.unwrap();
        assert_eq!(job(&db, crashed).status, JobStatus::Done);

        // a finished job is rejected and no audit is added
        let before = all_audits(&db).len();
        let err = orch.run_audit(crashed, ADDR, "sepolia", false).await.unwrap_err();
        assert!(matches!(err, AuditError::InvalidTransition { .. }));
        assert_eq!(all_audits(&db).len(), before);
        assert_eq!(job(&db, crashed).status, JobStatus::Done);
    }

    #[tokio::test]
    async fn test_code_probe_failure_is_recorded() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let probe = MockProbe {
            fail_code: true,
            ..Default::default()
        };
        let orch = orchestrator(&db, MockRegistry::returning(registry_payload()), probe);
        let job_id = queued_job(&db, "audit.run", json!({}));

        assert!(orch.run_audit(job_id, ADDR, "sepolia", false).await.is_err());
        assert_eq!(all_audits(&db)[0].status, AuditStatus::Error);
        assert_eq!(job(&db, job_id).status, JobStatus::Error);
    }

    #[tokio::test]
    async fn test_prediction_job() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let orch = orchestrator(&db, MockRegistry::failing(), MockProbe::default());
        let job_id = queued_job(&db, "ai.predict", json!({"feature1": 0.5, "feature2": 2}));

        let result = orch
            .handle(TaskMessage::AiPredict { job_id })
            .await
            .unwrap();
        assert_eq!(result["features_used"]["feature1"], 0.5);
        assert_eq!(result["model"], "Fixed");

        let job = job(&db, job_id);
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.result.unwrap()["risk_score"], 0.7109);

        let bad = queued_job(&db, "ai.predict", json!({"feature1": "x"}));
        assert!(orch.run_prediction(bad).await.is_err());
        assert_eq!(self::job(&db, bad).status, JobStatus::Error);
    }

    #[tokio::test]
    async fn test_receipt_wait_pending_then_done() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let receipts = MockReceipts::after(
            1,
            json!({"transactionHash": "0xfeed", "status": "0x1", "blockNumber": "0x10"}),
        );
        let orch = orchestrator(&db, MockRegistry::failing(), MockProbe::default()).with_receipts(
            Arc::new(receipts),
            ReceiptConfig {
                timeout: Duration::from_secs(5),
                poll_interval: Duration::from_millis(5),
            },
        );
        let job_id = queued_job(&db, "tx.await_receipt", json!({"tx_hash": "0xfeed"}));

        let result = orch.await_receipt(job_id, "0xfeed").await.unwrap();
        assert_eq!(result["status"], "mined");

        let job = job(&db, job_id);
        assert_eq!(job.status, JobStatus::Done);
        let stored = job.result.unwrap();
        assert_eq!(stored["receipt"]["blockNumber"], 16);
        assert_eq!(stored["tx_hash"], "0xfeed");
    }

    #[tokio::test]
    async fn test_receipt_timeout_moves_pending_to_error() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let orch = orchestrator(&db, MockRegistry::failing(), MockProbe::default()).with_receipts(
            Arc::new(MockReceipts::never()),
            ReceiptConfig {
                timeout: Duration::from_millis(20),
                poll_interval: Duration::from_millis(5),
            },
        );
        let job_id = queued_job(&db, "tx.await_receipt", json!({}));

        let err = orch.await_receipt(job_id, "0xdead").await.unwrap_err();
        assert!(matches!(err, AuditError::Timeout { .. }));
        let job = job(&db, job_id);
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.result.unwrap()["error"].as_str().unwrap().contains("0xdead"));
    }
}
