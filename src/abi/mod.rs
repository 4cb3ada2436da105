//! Contract interface definitions (ABIs)
//!
//! - **cache**: SQLite-backed ABI cache keyed by (address, network)
//! - **parse**: ordered payload parser strategies
//! - **registry**: remote block-explorer registry client
//! - **resolver**: ordered resolution chain (inline → file → registry/cache)

pub mod cache;
pub mod parse;
pub mod registry;
pub mod resolver;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::AuditError;

pub use cache::{AbiCacheRecord, AbiCacheStore};
pub use parse::{normalize_payload, normalize_text, PayloadStrategy, PAYLOAD_STRATEGIES};
pub use registry::{chain_id_for, AbiRegistry, EtherscanRegistry, RegistryConfig};
pub use resolver::{AbiResolver, ResolveOptions, ResolvedAbi};

/// Ordered sequence of function/event descriptors.
pub type InterfaceDefinition = Vec<AbiItem>;

/// One ABI descriptor (function, event, constructor, error, ...).
///
/// Unknown keys are preserved so a cached definition round-trips unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbiItem {
    #[serde(rename = "type", default = "default_item_type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<AbiParam>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<AbiParam>,
    #[serde(
        rename = "stateMutability",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub state_mutability: Option<String>,
    /// Pre-0.5 compilers flagged read-only functions with `constant`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constant: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Solidity omits `type` for functions in some toolchains.
fn default_item_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbiParam {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<AbiParam>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AbiItem {
    pub fn is_function(&self) -> bool {
        self.kind == "function"
    }

    /// view/pure functions (or legacy `constant: true`) cannot change state.
    pub fn is_read_only(&self) -> bool {
        match self.state_mutability.as_deref() {
            Some(m) => m == "view" || m == "pure",
            None => self.constant.unwrap_or(false),
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }
}

/// Find a function descriptor by name.
pub fn find_function<'a>(abi: &'a [AbiItem], name: &str) -> Option<&'a AbiItem> {
    abi.iter().find(|item| item.is_function() && item.name() == name)
}

/// Where a cached interface definition came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    #[serde(rename = "manual")]
    Manual,
    #[serde(rename = "inline")]
    Inline,
    #[serde(rename = "file")]
    File,
    #[serde(rename = "remote-registry", alias = "etherscan")]
    RemoteRegistry,
}

impl Provenance {
    pub fn as_str(self) -> &'static str {
        match self {
            Provenance::Manual => "manual",
            Provenance::Inline => "inline",
            Provenance::File => "file",
            Provenance::RemoteRegistry => "remote-registry",
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provenance {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Provenance::Manual),
            "inline" => Ok(Provenance::Inline),
            "file" => Ok(Provenance::File),
            "remote-registry" | "etherscan" => Ok(Provenance::RemoteRegistry),
            other => Err(AuditError::Internal(format!("unknown ABI provenance: {other}"))),
        }
    }
}
