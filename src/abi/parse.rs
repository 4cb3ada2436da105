//! ABI payload normalization
//!
//! Registries and ABI files do not agree on a shape. A payload may be:
//! - a list of descriptor objects
//! - a single descriptor object
//! - a build artifact carrying an `abi` field
//! - any of the above pre-encoded as a JSON string
//!
//! Each shape is a named strategy, tried in order. The first structural
//! match wins; the payload is rejected only if every strategy declines.

use serde_json::Value;
use tracing::debug;

use super::{AbiItem, InterfaceDefinition};
use crate::error::{AuditError, Result};

/// A named parser for one payload shape.
pub struct PayloadStrategy {
    pub name: &'static str,
    pub parse: fn(&Value) -> Option<InterfaceDefinition>,
}

/// Strategies in priority order.
pub const PAYLOAD_STRATEGIES: &[PayloadStrategy] = &[
    PayloadStrategy {
        name: "encoded-string",
        parse: parse_encoded_string,
    },
    PayloadStrategy {
        name: "descriptor-list",
        parse: parse_descriptor_list,
    },
    PayloadStrategy {
        name: "artifact-envelope",
        parse: parse_artifact_envelope,
    },
    PayloadStrategy {
        name: "single-descriptor",
        parse: parse_single_descriptor,
    },
];

/// Normalize a raw payload into an interface definition.
pub fn normalize_payload(payload: &Value) -> Result<InterfaceDefinition> {
    for strategy in PAYLOAD_STRATEGIES {
        if let Some(abi) = (strategy.parse)(payload) {
            debug!(
                strategy = strategy.name,
                descriptors = abi.len(),
                "ABI payload normalized"
            );
            return Ok(abi);
        }
    }

    Err(AuditError::AbiParse(format!(
        "payload matched none of the accepted shapes ({})",
        describe(payload)
    )))
}

/// Parse ABI text (file contents, CLI input) through the same strategies.
pub fn normalize_text(text: &str) -> Result<InterfaceDefinition> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| AuditError::AbiParse(format!("invalid JSON: {e}")))?;
    normalize_payload(&value)
}

fn parse_encoded_string(payload: &Value) -> Option<InterfaceDefinition> {
    let text = payload.as_str()?;
    let decoded: Value = serde_json::from_str(text).ok()?;
    // One level of encoding only; a string inside a string is not an ABI.
    if decoded.is_string() {
        return None;
    }
    PAYLOAD_STRATEGIES
        .iter()
        .skip(1)
        .find_map(|strategy| (strategy.parse)(&decoded))
}

fn parse_descriptor_list(payload: &Value) -> Option<InterfaceDefinition> {
    let items = payload.as_array()?;
    if items.is_empty() {
        return None;
    }
    items.iter().map(descriptor).collect()
}

fn parse_artifact_envelope(payload: &Value) -> Option<InterfaceDefinition> {
    let abi = payload.as_object()?.get("abi")?;
    parse_descriptor_list(abi).or_else(|| parse_encoded_string(abi))
}

fn parse_single_descriptor(payload: &Value) -> Option<InterfaceDefinition> {
    descriptor(payload).map(|item| vec![item])
}

/// A descriptor is an object naming at least its type or its name.
fn descriptor(value: &Value) -> Option<AbiItem> {
    let object = value.as_object()?;
    let typed = object.get("type").map(Value::is_string).unwrap_or(false);
    let named = object.get("name").map(Value::is_string).unwrap_or(false);
    if !typed && !named {
        return None;
    }
    serde_json::from_value(value.clone()).ok()
}

fn describe(payload: &Value) -> &'static str {
    match payload {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
