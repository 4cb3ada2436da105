//! Ethereum JSON-RPC client

use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::codec::{decode_hex, decode_output, encode_call};
use super::{AbiValue, ChainProbe, ReceiptSource};
use crate::abi::{find_function, InterfaceDefinition};
use crate::address::ContractAddress;
use crate::error::{AuditError, Result};

/// RPC endpoint configuration
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Provider URL; calls fail with an RPC error while unset
    pub url: Option<String>,
    pub timeout: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout: Duration::from_secs(10),
        }
    }
}

/// HTTP JSON-RPC client
pub struct JsonRpcClient {
    client: reqwest::Client,
    config: RpcConfig,
}

impl JsonRpcClient {
    pub fn new(config: RpcConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AuditError::Config(format!("failed to build RPC client: {e}")))?;
        Ok(Self { client, config })
    }

    async fn rpc_call(&self, method: &str, params: Value) -> Result<Value> {
        let url = self
            .config
            .url
            .as_deref()
            .ok_or_else(|| AuditError::Rpc("WEB3_PROVIDER_URI is not set".to_string()))?;

        debug!(method, "RPC call");

        let response = self
            .client
            .post(url)
            .json(&json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
                "id": 1
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AuditError::Rpc(format!(
                        "{method} timed out after {}s",
                        self.config.timeout.as_secs()
                    ))
                } else {
                    AuditError::Rpc(format!("{method} failed: {e}"))
                }
            })?;

        if !response.status().is_success() {
            return Err(AuditError::Rpc(format!(
                "{method} returned HTTP {}",
                response.status()
            )));
        }

        let mut body: Value = response
            .json()
            .await
            .map_err(|e| AuditError::Rpc(format!("failed to parse {method} response: {e}")))?;

        if let Some(error) = body.get("error") {
            return Err(AuditError::Rpc(format!("{method} returned error: {error}")));
        }

        Ok(body.get_mut("result").map(Value::take).unwrap_or(Value::Null))
    }

    pub async fn eth_get_code(&self, address: &ContractAddress) -> Result<String> {
        let result = self
            .rpc_call("eth_getCode", json!([address.checksum(), "latest"]))
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| AuditError::Rpc("eth_getCode result was missing".to_string()))
    }

    pub async fn eth_call(&self, address: &ContractAddress, calldata: &str) -> Result<String> {
        let result = self
            .rpc_call(
                "eth_call",
                json!([{"to": address.checksum(), "data": calldata}, "latest"]),
            )
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| AuditError::Rpc("eth_call result was missing".to_string()))
    }
}

#[async_trait::async_trait]
impl ChainProbe for JsonRpcClient {
    async fn code_size(&self, address: &ContractAddress) -> Result<usize> {
        let code = self.eth_get_code(address).await?;
        Ok(decode_hex(&code)?.len())
    }

    async fn call_read_only(
        &self,
        address: &ContractAddress,
        abi: &InterfaceDefinition,
        function: &str,
    ) -> Result<AbiValue> {
        let item = find_function(abi, function)
            .ok_or_else(|| AuditError::Rpc(format!("{function} is not in the interface")))?;
        let calldata = encode_call(item)?;
        let data = self.eth_call(address, &calldata).await?;
        decode_output(item, &data)
    }
}

#[async_trait::async_trait]
impl ReceiptSource for JsonRpcClient {
    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<Value>> {
        let result = self
            .rpc_call("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;
        Ok(if result.is_null() { None } else { Some(result) })
    }
}
