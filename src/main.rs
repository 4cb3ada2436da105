//! contract-auditor - smart-contract risk audits

use clap::Parser;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use contract_auditor::{
    abi::{AbiCacheStore, AbiRegistry, AbiResolver, EtherscanRegistry},
    chain::JsonRpcClient,
    config::{Args, Command},
    db::jobs::{JobRow, JobStatus},
    features::FeatureExtractor,
    logging,
    queue::WorkerPool,
    scoring::{IsolationForest, RiskScorer},
    AuditOrchestrator, AuditService, Database,
};

/// How often the CLI re-reads a job it is waiting on
const JOB_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    logging::init_tracing(&args.log_level, args.log_json);

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    if let Command::TrainModel { output } = &args.command {
        let forest = IsolationForest::train_default(&args.forest_config())?;
        forest.save(output)?;
        info!(path = %output.display(), trees = forest.tree_count(), "Model saved");
        return Ok(());
    }

    let pool_config = args.pool_config();

    info!("======================================");
    info!("  contract-auditor");
    info!("======================================");
    info!("Database: {}", args.database_path.display());
    info!("Default network: {}", args.default_network);
    info!(
        "Registry: {} (api key {})",
        args.registry.etherscan_api_url,
        if args.registry.etherscan_api_key.is_some() { "set" } else { "unset" }
    );
    info!(
        "RPC provider: {}",
        args.chain.web3_provider_uri.as_deref().unwrap_or("unset")
    );
    info!("Workers: {}", pool_config.worker_count);
    info!("======================================");

    let db = Arc::new(Database::open(&args.database_path)?);

    let registry: Arc<dyn AbiRegistry> = Arc::new(EtherscanRegistry::new(args.registry_config())?);
    let resolver = Arc::new(
        AbiResolver::new(AbiCacheStore::new(Arc::clone(&db)), Some(registry))
            .with_default_network(args.default_network.clone()),
    );

    let rpc = Arc::new(JsonRpcClient::new(args.rpc_config())?);
    let extractor = Arc::new(FeatureExtractor::new(rpc.clone()));

    let forest = Arc::new(IsolationForest::load_or_train(&args.forest_config())?);
    let scorer = RiskScorer::new(forest);

    let orchestrator = AuditOrchestrator::new(Arc::clone(&db), resolver, extractor, scorer.clone())
        .with_receipts(rpc, args.receipt_config());

    let pool = Arc::new(WorkerPool::start(pool_config, Arc::new(orchestrator)));
    let service = AuditService::new(Arc::clone(&db), pool.clone(), scorer);

    let outcome = run_command(&args.command, &service).await;
    pool.shutdown().await;

    match outcome {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}

/// Execute one subcommand; `Ok(false)` means the job it waited on failed
async fn run_command(command: &Command, service: &AuditService) -> anyhow::Result<bool> {
    match command {
        Command::Worker => {
            info!("Worker pool running, press Ctrl+C to stop");
            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received");
        }
        Command::Audit {
            address,
            network,
            force_refresh,
        } => {
            let ack = service.enqueue_audit(address, network, *force_refresh).await?;
            print_json(&ack)?;
            let job = wait_for_job(service, ack.job_id).await?;
            let audit = match job.result.as_ref().and_then(|r| r["audit_id"].as_i64()) {
                Some(audit_id) => Some(service.get_audit(audit_id)?),
                None => None,
            };
            print_json(&json!({ "job": &job, "audit": audit }))?;
            return Ok(job.status == JobStatus::Done);
        }
        Command::Status { job_id } => print_json(&service.job_status(*job_id)?)?,
        Command::Show { audit_id } => print_json(&service.get_audit(*audit_id)?)?,
        Command::List { address } => print_json(&service.list_audits(address.as_deref())?)?,
        Command::RegisterAbi {
            address,
            abi_file,
            network,
        } => {
            let text = std::fs::read_to_string(abi_file)?;
            let record = service.register_abi(address, network, &Value::String(text))?;
            print_json(&record)?;
        }
        Command::Predict { feature1, feature2 } => {
            let params = json!({ "feature1": feature1, "feature2": feature2 });
            print_json(&service.predict(&params)?)?;
        }
        Command::AwaitReceipt { tx_hash } => {
            let ack = service.enqueue_receipt_wait(tx_hash).await?;
            print_json(&ack)?;
            let job = wait_for_job(service, ack.job_id).await?;
            print_json(&job)?;
            return Ok(job.status == JobStatus::Done);
        }
        Command::TrainModel { .. } => {}
    }
    Ok(true)
}

async fn wait_for_job(service: &AuditService, job_id: i64) -> anyhow::Result<JobRow> {
    loop {
        let job = service.job_status(job_id)?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        tokio::time::sleep(JOB_POLL_INTERVAL).await;
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
