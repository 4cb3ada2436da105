//! Contract address normalization (EIP-55)
//!
//! Every component keys contracts by the same two forms:
//! - the checksummed display form (`0x5aAeb6...`) stored on audits
//! - the lowercase lookup key used for case-insensitive lookups

use alloy_primitives::Address;
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{AuditError, Result};

/// A validated 20-byte contract address in EIP-55 checksum form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContractAddress {
    checksum: String,
}

impl ContractAddress {
    /// Parse and checksum an address.
    ///
    /// Accepts any letter casing; a mixed-case input is re-checksummed rather
    /// than verified, matching how the registry and RPC nodes treat input.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AuditError::InvalidAddress("address is empty".to_string()));
        }

        let body = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| {
                AuditError::InvalidAddress(format!("{trimmed}: missing 0x prefix"))
            })?;

        if body.len() != 40 {
            return Err(AuditError::InvalidAddress(format!(
                "{trimmed}: expected 20 bytes of hex"
            )));
        }
        let address = Address::from_str(body).map_err(|e| {
            AuditError::InvalidAddress(format!("{trimmed}: {e}"))
        })?;

        Ok(Self::from(address))
    }

    /// EIP-55 checksummed form.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Case-folded form used as the storage lookup key.
    pub fn lookup_key(&self) -> String {
        self.checksum.to_ascii_lowercase()
    }
}

impl fmt::Display for ContractAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.checksum)
    }
}

impl Serialize for ContractAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.checksum)
    }
}

impl From<Address> for ContractAddress {
    fn from(address: Address) -> Self {
        Self {
            checksum: address.to_checksum(None),
        }
    }
}
