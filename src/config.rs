//! Configuration for contract-auditor
//!
//! CLI arguments and environment variable handling using clap. Each
//! component gets its own plain config struct derived from [`Args`].

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::abi::registry::{DEFAULT_NETWORK, DEFAULT_REGISTRY_URL};
use crate::abi::RegistryConfig;
use crate::chain::{ReceiptConfig, RpcConfig};
use crate::error::{AuditError, Result};
use crate::queue::PoolConfig;
use crate::scoring::ForestConfig;

/// Contract auditor - ABI resolution, feature extraction and risk scoring
#[derive(Parser, Debug, Clone)]
#[command(name = "contract-auditor")]
#[command(about = "Audit smart contracts for structural risk")]
pub struct Args {
    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "./data/auditor.db", global = true)]
    pub database_path: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false", global = true)]
    pub log_json: bool,

    /// Network assumed when a request names an unknown one
    #[arg(long, env = "DEFAULT_NETWORK", default_value = DEFAULT_NETWORK, global = true)]
    pub default_network: String,

    #[command(flatten)]
    pub registry: RegistryArgs,

    #[command(flatten)]
    pub chain: ChainArgs,

    #[command(flatten)]
    pub worker: WorkerArgs,

    /// Saved isolation-forest model (trained from defaults when absent)
    #[arg(long, env = "AI_MODEL_PATH", global = true)]
    pub ai_model_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Block-explorer registry settings
#[derive(ClapArgs, Debug, Clone)]
pub struct RegistryArgs {
    /// Etherscan API key (required for registry fetches)
    #[arg(long, env = "ETHERSCAN_API_KEY", global = true, hide_env_values = true)]
    pub etherscan_api_key: Option<String>,

    /// Etherscan v2 API endpoint
    #[arg(long, env = "ETHERSCAN_API_URL", default_value = DEFAULT_REGISTRY_URL, global = true)]
    pub etherscan_api_url: String,

    /// Registry request timeout in seconds
    #[arg(long, env = "REGISTRY_TIMEOUT_SECS", default_value = "20", global = true)]
    pub registry_timeout_secs: u64,
}

/// JSON-RPC provider settings
#[derive(ClapArgs, Debug, Clone)]
pub struct ChainArgs {
    /// JSON-RPC provider URL
    #[arg(long, env = "WEB3_PROVIDER_URI", global = true)]
    pub web3_provider_uri: Option<String>,

    /// RPC request timeout in seconds
    #[arg(long, env = "RPC_TIMEOUT_SECS", default_value = "10", global = true)]
    pub rpc_timeout_secs: u64,

    /// Maximum wait for a transaction receipt in seconds
    #[arg(long, env = "RECEIPT_TIMEOUT_SECS", default_value = "600", global = true)]
    pub receipt_timeout_secs: u64,

    /// Receipt poll interval in milliseconds
    #[arg(long, env = "RECEIPT_POLL_INTERVAL_MS", default_value = "2000", global = true)]
    pub receipt_poll_interval_ms: u64,
}

/// Worker pool settings
#[derive(ClapArgs, Debug, Clone)]
pub struct WorkerArgs {
    /// Number of worker tasks (defaults to the CPU count)
    #[arg(long, env = "WORKER_COUNT", global = true)]
    pub worker_count: Option<usize>,

    /// Maximum queued tasks
    #[arg(long, env = "MAX_QUEUE_SIZE", default_value = "1000", global = true)]
    pub max_queue_size: usize,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the worker pool until interrupted
    Worker,
    /// Queue an audit, run it, and print the job and audit
    Audit {
        address: String,
        #[arg(long, default_value = DEFAULT_NETWORK)]
        network: String,
        /// Refetch the ABI instead of using the cache
        #[arg(long)]
        force_refresh: bool,
    },
    /// Show a job's status and result
    Status { job_id: i64 },
    /// Show an audit
    Show { audit_id: i64 },
    /// List recent audits, newest first
    List {
        #[arg(long)]
        address: Option<String>,
    },
    /// Store an ABI for an address (provenance manual)
    RegisterAbi {
        address: String,
        /// JSON file: descriptor list, single descriptor or build artifact
        abi_file: PathBuf,
        #[arg(long, default_value = DEFAULT_NETWORK)]
        network: String,
    },
    /// Score a (write_ratio, risky_flags) pair
    Predict { feature1: f64, feature2: f64 },
    /// Wait for a broadcast transaction's receipt
    AwaitReceipt { tx_hash: String },
    /// Train the default model and save it
    TrainModel { output: PathBuf },
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.worker.worker_count == Some(0) {
            return Err(AuditError::Config("WORKER_COUNT must be at least 1".to_string()));
        }
        if self.worker.max_queue_size == 0 {
            return Err(AuditError::Config("MAX_QUEUE_SIZE must be at least 1".to_string()));
        }
        if self.registry.registry_timeout_secs == 0 || self.chain.rpc_timeout_secs == 0 {
            return Err(AuditError::Config("timeouts must be at least 1 second".to_string()));
        }
        if self.chain.receipt_poll_interval_ms == 0 {
            return Err(AuditError::Config(
                "RECEIPT_POLL_INTERVAL_MS must be at least 1".to_string(),
            ));
        }
        if let Some(uri) = &self.chain.web3_provider_uri {
            if !(uri.starts_with("http://") || uri.starts_with("https://")) {
                return Err(AuditError::Config(format!(
                    "WEB3_PROVIDER_URI must be an http(s) URL, got {uri}"
                )));
            }
        }
        Ok(())
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            api_url: self.registry.etherscan_api_url.clone(),
            api_key: self.registry.etherscan_api_key.clone(),
            timeout: Duration::from_secs(self.registry.registry_timeout_secs),
        }
    }

    pub fn rpc_config(&self) -> RpcConfig {
        RpcConfig {
            url: self.chain.web3_provider_uri.clone(),
            timeout: Duration::from_secs(self.chain.rpc_timeout_secs),
        }
    }

    pub fn receipt_config(&self) -> ReceiptConfig {
        ReceiptConfig {
            timeout: Duration::from_secs(self.chain.receipt_timeout_secs),
            poll_interval: Duration::from_millis(self.chain.receipt_poll_interval_ms),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            worker_count: self.worker.worker_count.unwrap_or_else(num_cpus::get),
            max_queue_size: self.worker.max_queue_size,
        }
    }

    pub fn forest_config(&self) -> ForestConfig {
        ForestConfig {
            model_path: self.ai_model_path.clone(),
            ..ForestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("contract-auditor").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["worker"]);
        assert!(args.validate().is_ok());
        assert_eq!(args.default_network, "sepolia");
        assert_eq!(args.registry_config().timeout, Duration::from_secs(20));
        assert_eq!(args.rpc_config().timeout, Duration::from_secs(10));
        assert_eq!(args.receipt_config().timeout, Duration::from_secs(600));
        assert_eq!(args.receipt_config().poll_interval, Duration::from_millis(2000));
        assert!(args.pool_config().worker_count >= 1);
    }

    #[test]
    fn test_subcommand_arguments() {
        let args = parse(&[
            "--worker-count",
            "2",
            "audit",
            "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed",
            "--network",
            "mainnet",
            "--force-refresh",
        ]);
        assert_eq!(args.pool_config().worker_count, 2);
        match args.command {
            Command::Audit {
                network,
                force_refresh,
                ..
            } => {
                assert_eq!(network, "mainnet");
                assert!(force_refresh);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_validation() {
        let args = parse(&["--worker-count", "0", "worker"]);
        assert!(matches!(args.validate(), Err(AuditError::Config(_))));

        let args = parse(&["--web3-provider-uri", "ws://node:8546", "worker"]);
        assert!(args.validate().is_err());
    }
}
