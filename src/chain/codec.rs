//! ABI call codec for zero-argument read-only functions
//!
//! Return data is decoded with `alloy-dyn-abi` against the declared output
//! type. Only the first output is read; that covers token metadata getters
//! (`name`, `symbol`, `decimals`, `totalSupply`, `owner`, `paused`).

use alloy_dyn_abi::{DynSolType, DynSolValue};
use alloy_primitives::keccak256;

use super::AbiValue;
use crate::abi::{AbiItem, AbiParam};
use crate::error::{AuditError, Result};

/// `name(type,...)` for a function descriptor
pub fn canonical_signature(item: &AbiItem) -> String {
    let inputs = item
        .inputs
        .iter()
        .map(|param| canonical_type(&param.kind, &param.components))
        .collect::<Vec<_>>();
    format!("{}({})", item.name().trim(), inputs.join(","))
}

fn canonical_type(kind: &str, components: &[AbiParam]) -> String {
    if let Some(suffix) = kind.strip_prefix("tuple") {
        let inner = components
            .iter()
            .map(|c| canonical_type(&c.kind, &c.components))
            .collect::<Vec<_>>();
        return format!("({}){suffix}", inner.join(","));
    }
    match kind {
        "uint" => "uint256".to_string(),
        "int" => "int256".to_string(),
        other => other.to_string(),
    }
}

/// First four bytes of keccak256(signature)
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Calldata for a zero-argument call
pub fn encode_call(item: &AbiItem) -> Result<String> {
    if !item.inputs.is_empty() {
        return Err(AuditError::Rpc(format!(
            "{} takes {} arguments; only zero-argument calls are supported",
            item.name(),
            item.inputs.len()
        )));
    }
    Ok(format!("0x{}", hex::encode(selector(&canonical_signature(item)))))
}

/// Decode the first return value of a call
pub fn decode_output(item: &AbiItem, data_hex: &str) -> Result<AbiValue> {
    let output = item
        .outputs
        .first()
        .ok_or_else(|| AuditError::Rpc(format!("{} declares no outputs", item.name())))?;

    let data = decode_hex(data_hex)?;
    if data.is_empty() {
        return Err(AuditError::Rpc(format!(
            "{} returned no data (reverted or not a contract)",
            item.name()
        )));
    }

    let kind = canonical_type(&output.kind, &output.components);
    // strings are read as raw bytes so invalid UTF-8 fails instead of being replaced
    let ty = if kind == "string" {
        DynSolType::Bytes
    } else {
        DynSolType::parse(&kind)
            .map_err(|e| AuditError::Rpc(format!("unsupported return type {kind}: {e}")))?
    };

    let value = ty.abi_decode(&data).map_err(|e| {
        AuditError::Rpc(format!("{} returned malformed {kind}: {e}", item.name()))
    })?;

    to_abi_value(value, &kind)
}

fn to_abi_value(value: DynSolValue, kind: &str) -> Result<AbiValue> {
    match value {
        DynSolValue::Bytes(bytes) if kind == "string" => String::from_utf8(bytes)
            .map(AbiValue::String)
            .map_err(|_| AuditError::Rpc("string return value is not valid UTF-8".to_string())),
        DynSolValue::Bytes(bytes) => Ok(AbiValue::Bytes(format!("0x{}", hex::encode(bytes)))),
        DynSolValue::FixedBytes(word, size) => {
            Ok(AbiValue::Bytes(format!("0x{}", hex::encode(&word[..size]))))
        }
        DynSolValue::Bool(flag) => Ok(AbiValue::Bool(flag)),
        DynSolValue::Address(address) => Ok(AbiValue::Address(address.to_checksum(None))),
        DynSolValue::Uint(number, _) => Ok(AbiValue::Uint(number.to_string())),
        DynSolValue::Int(number, _) => Ok(AbiValue::Int(number.to_string())),
        _ => Err(AuditError::Rpc(format!("unsupported return type {kind}"))),
    }
}

pub(crate) fn decode_hex(raw: &str) -> Result<Vec<u8>> {
    let trimmed = raw.trim();
    let body = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    hex::decode(body).map_err(|e| AuditError::Rpc(format!("invalid hex in RPC response: {e}")))
}
