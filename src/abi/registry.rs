//! Remote ABI registry (block explorer)
//!
//! The registry returns a raw payload; shape normalization is left to
//! [`super::parse`] so every source goes through the same strategies.

use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::address::ContractAddress;
use crate::error::{AuditError, Result};

pub const DEFAULT_REGISTRY_URL: &str = "https://api.etherscan.io/v2/api";
pub const DEFAULT_NETWORK: &str = "sepolia";

const SEPOLIA_CHAIN_ID: u64 = 11_155_111;

/// Remote source of contract interface definitions
#[async_trait::async_trait]
pub trait AbiRegistry: Send + Sync {
    /// Fetch the raw ABI payload for a verified contract
    async fn fetch_abi(&self, address: &ContractAddress, chain_id: u64) -> Result<Value>;
}

/// Registry client configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_REGISTRY_URL.to_string(),
            api_key: None,
            timeout: Duration::from_secs(20),
        }
    }
}

/// Map a network name to its chain id.
///
/// Unknown names fall back to `default_network` (and then to sepolia).
pub fn chain_id_for(network: &str, default_network: &str) -> u64 {
    if let Some(id) = known_chain_id(network) {
        return id;
    }
    warn!(
        network,
        fallback = default_network,
        "Unknown network, using default network chain id"
    );
    known_chain_id(default_network).unwrap_or(SEPOLIA_CHAIN_ID)
}

fn known_chain_id(network: &str) -> Option<u64> {
    match network.trim().to_ascii_lowercase().as_str() {
        "mainnet" | "ethereum" => Some(1),
        "sepolia" => Some(SEPOLIA_CHAIN_ID),
        "holesky" => Some(17_000),
        "optimism" => Some(10),
        "bsc" => Some(56),
        "polygon" => Some(137),
        "base" => Some(8_453),
        "arbitrum" => Some(42_161),
        _ => None,
    }
}

/// Etherscan v2 `module=contract&action=getabi` client
pub struct EtherscanRegistry {
    client: reqwest::Client,
    config: RegistryConfig,
}

impl EtherscanRegistry {
    pub fn new(config: RegistryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AuditError::Config(format!("failed to build registry client: {e}")))?;
        Ok(Self { client, config })
    }
}

#[async_trait::async_trait]
impl AbiRegistry for EtherscanRegistry {
    async fn fetch_abi(&self, address: &ContractAddress, chain_id: u64) -> Result<Value> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| AuditError::AbiFetch("ETHERSCAN_API_KEY is not set".to_string()))?;

        debug!(address = %address, chain_id, "Fetching ABI from registry");

        let chain_id = chain_id.to_string();
        let response = self
            .client
            .get(&self.config.api_url)
            .query(&[
                ("chainid", chain_id.as_str()),
                ("module", "contract"),
                ("action", "getabi"),
                ("address", address.checksum()),
                ("apikey", api_key),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AuditError::AbiFetch(format!(
                        "registry request timed out after {}s",
                        self.config.timeout.as_secs()
                    ))
                } else {
                    AuditError::AbiFetch(format!("registry request failed: {e}"))
                }
            })?;

        if !response.status().is_success() {
            return Err(AuditError::AbiFetch(format!(
                "registry returned HTTP {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AuditError::AbiFetch(format!("unreadable registry response: {e}")))?;

        registry_result(body)
    }
}

/// Unwrap the `{status, message, result}` envelope.
///
/// Etherscan reports status as the string "1" on success; anything else is
/// a request-level failure whose reason is in `message` and `result`.
pub(crate) fn registry_result(mut body: Value) -> Result<Value> {
    let status = match body.get("status") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };

    if status != "1" {
        let message = body.get("message").and_then(Value::as_str).unwrap_or("");
        let result = match body.get("result") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        return Err(AuditError::AbiFetch(format!(
            "registry error: {message} ({result})"
        )));
    }

    body.get_mut("result")
        .map(Value::take)
        .ok_or_else(|| AuditError::AbiFetch("registry response carried no result".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chain_ids() {
        assert_eq!(chain_id_for("mainnet", DEFAULT_NETWORK), 1);
        assert_eq!(chain_id_for("Ethereum", DEFAULT_NETWORK), 1);
        assert_eq!(chain_id_for("sepolia", DEFAULT_NETWORK), 11_155_111);
        assert_eq!(chain_id_for("arbitrum", DEFAULT_NETWORK), 42_161);
        assert_eq!(chain_id_for("goerli", DEFAULT_NETWORK), 11_155_111);
        assert_eq!(chain_id_for("goerli", "polygon"), 137);
        assert_eq!(chain_id_for("goerli", "nowhere"), 11_155_111);
    }

    #[test]
    fn test_registry_result_success() {
        let payload = registry_result(json!({
            "status": "1",
            "message": "OK",
            "result": "[{\"type\":\"function\",\"name\":\"owner\"}]"
        }))
        .unwrap();
        assert!(payload.is_string());
    }

    #[test]
    fn test_registry_result_failure() {
        let err = registry_result(json!({
            "status": "0",
            "message": "NOTOK",
            "result": "Contract source code not verified"
        }))
        .unwrap_err();
        match err {
            AuditError::AbiFetch(msg) => {
                assert!(msg.contains("NOTOK"));
                assert!(msg.contains("not verified"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_api_key() {
        let registry = EtherscanRegistry::new(RegistryConfig::default()).unwrap();
        let address = ContractAddress::parse("0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed").unwrap();
        let err = registry.fetch_abi(&address, 1).await.unwrap_err();
        assert!(matches!(err, AuditError::AbiFetch(_)));
    }
}
