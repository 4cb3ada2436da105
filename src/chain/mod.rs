//! On-chain access
//!
//! - **codec**: selectors and return-value decoding
//! - **rpc**: JSON-RPC client implementing [`ChainProbe`] and [`ReceiptSource`]
//!
//! The pipeline only depends on the traits; tests substitute fakes.

pub mod codec;
pub mod rpc;

use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, info};

use crate::abi::InterfaceDefinition;
use crate::address::ContractAddress;
use crate::error::{AuditError, Result};

pub use rpc::{JsonRpcClient, RpcConfig};

/// A decoded return value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AbiValue {
    String(String),
    /// Unsigned integer as a decimal string (may exceed u64)
    Uint(String),
    /// Signed integer as a decimal string
    Int(String),
    Bool(bool),
    Address(String),
    Bytes(String),
}

impl AbiValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AbiValue::String(s) | AbiValue::Address(s) | AbiValue::Bytes(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            AbiValue::Uint(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Integer values as decimal text
    pub fn as_decimal(&self) -> Option<&str> {
        match self {
            AbiValue::Uint(s) | AbiValue::Int(s) => Some(s),
            _ => None,
        }
    }
}

/// Read access to deployed contracts
#[async_trait::async_trait]
pub trait ChainProbe: Send + Sync {
    /// Deployed bytecode length in bytes (0 for externally owned accounts)
    async fn code_size(&self, address: &ContractAddress) -> Result<usize>;

    /// Call a zero-argument read-only function and decode its first output
    async fn call_read_only(
        &self,
        address: &ContractAddress,
        abi: &InterfaceDefinition,
        function: &str,
    ) -> Result<AbiValue>;
}

/// Source of transaction receipts
#[async_trait::async_trait]
pub trait ReceiptSource: Send + Sync {
    /// `None` until the transaction is mined
    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<Value>>;
}

/// Receipt wait bounds
#[derive(Debug, Clone)]
pub struct ReceiptConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ReceiptConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Poll for a receipt until it appears or the timeout elapses.
///
/// Returns the cleaned receipt.
pub async fn wait_for_receipt(
    source: &dyn ReceiptSource,
    tx_hash: &str,
    config: &ReceiptConfig,
) -> Result<Value> {
    info!(tx_hash, timeout_secs = config.timeout.as_secs(), "Waiting for transaction receipt");

    let poll = async {
        loop {
            if let Some(receipt) = source.transaction_receipt(tx_hash).await? {
                return Ok::<_, AuditError>(receipt);
            }
            debug!(tx_hash, "Receipt not available yet");
            tokio::time::sleep(config.poll_interval).await;
        }
    };

    let receipt = tokio::time::timeout(config.timeout, poll)
        .await
        .map_err(|_| AuditError::Timeout {
            operation: format!("waiting for receipt of {tx_hash}"),
            secs: config.timeout.as_secs(),
        })??;

    Ok(clean_receipt(&receipt))
}

const RECEIPT_HASH_FIELDS: [&str; 3] = ["transactionHash", "blockHash", "contractAddress"];
const RECEIPT_QUANTITY_FIELDS: [&str; 6] = [
    "blockNumber",
    "transactionIndex",
    "cumulativeGasUsed",
    "effectiveGasPrice",
    "gasUsed",
    "status",
];

/// Keep the receipt fields callers care about, with quantities as integers.
///
/// Logs and bloom are dropped; absent or null fields are omitted.
pub fn clean_receipt(receipt: &Value) -> Value {
    let mut cleaned = Map::new();

    for field in RECEIPT_HASH_FIELDS {
        if let Some(value) = receipt.get(field).filter(|v| !v.is_null()) {
            cleaned.insert(field.to_string(), value.clone());
        }
    }

    for field in RECEIPT_QUANTITY_FIELDS {
        if let Some(value) = receipt.get(field).filter(|v| !v.is_null()) {
            cleaned.insert(field.to_string(), quantity(value));
        }
    }

    Value::Object(cleaned)
}

/// `"0x1b4"` → 436; values that do not fit stay as given
fn quantity(value: &Value) -> Value {
    value
        .as_str()
        .and_then(|s| s.strip_prefix("0x"))
        .and_then(|hex| u64::from_str_radix(hex, 16).ok())
        .map(Value::from)
        .unwrap_or_else(|| value.clone())
}


#[cfg(test)]
mod tests {
    use super::mock::MockReceipts;
    use super::*;
    use serde_json::json;

    fn raw_receipt() -> Value {
        json!({
            "transactionHash": "0xabc",
            "blockHash": "0xdef",
            "blockNumber": "0x1b4",
            "transactionIndex": "0x0",
            "cumulativeGasUsed": "0x5208",
            "effectiveGasPrice": "0x3b9aca00",
            "gasUsed": "0x5208",
            "status": "0x1",
            "contractAddress": null,
            "logs": [],
            "logsBloom": "0x00"
        })
    }

    #[test]
    fn test_clean_receipt() {
        let cleaned = clean_receipt(&raw_receipt());
        assert_eq!(cleaned["blockNumber"], 436);
        assert_eq!(cleaned["gasUsed"], 21000);
        assert_eq!(cleaned["status"], 1);
        assert_eq!(cleaned["transactionHash"], "0xabc");
        assert!(cleaned.get("contractAddress").is_none());
        assert!(cleaned.get("logs").is_none());
    }

    #[tokio::test]
    async fn test_wait_polls_until_mined() {
        let source = MockReceipts::after(2, raw_receipt());
        let config = ReceiptConfig {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(5),
        };
        let receipt = wait_for_receipt(&source, "0xabc", &config).await.unwrap();
        assert_eq!(receipt["status"], 1);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let source = MockReceipts::never();
        let config = ReceiptConfig {
            timeout: Duration::from_millis(30),
            poll_interval: Duration::from_millis(5),
        };
        let err = wait_for_receipt(&source, "0xabc", &config).await.unwrap_err();
        assert!(matches!(err, AuditError::Timeout { .. }));
    }

    #[test]
    fn test_abi_value_accessors() {
        assert_eq!(AbiValue::Uint("18".into()).as_u64(), Some(18));
        assert_eq!(AbiValue::String("Token".into()).as_str(), Some("Token"));
        assert_eq!(serde_json::to_value(AbiValue::Bool(true)).unwrap(), json!(true));
    }
}
