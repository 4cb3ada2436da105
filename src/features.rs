//! Contract feature extraction
//!
//! Structural features come from the interface alone; `is_contract` and
//! `code_len` come from the code probe, and token metadata is read
//! best-effort through zero-argument calls.

use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::abi::{AbiItem, InterfaceDefinition};
use crate::address::ContractAddress;
use crate::chain::{AbiValue, ChainProbe};
use crate::error::Result;
use crate::scoring::ScoreInput;

/// Function-name presence flags
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RiskFlags {
    pub has_approve: bool,
    pub has_transfer_from: bool,
    pub has_mint: bool,
    pub has_burn: bool,
    pub has_pause: bool,
    pub has_owner: bool,
    pub has_transfer_ownership: bool,
    pub has_withdraw: bool,
}

impl RiskFlags {
    fn from_names(names: &[&str]) -> Self {
        let has = |candidates: &[&str]| candidates.iter().any(|c| names.contains(c));
        Self {
            has_approve: has(&["approve"]),
            has_transfer_from: has(&["transferFrom"]),
            has_mint: has(&["mint", "mintTo"]),
            has_burn: has(&["burn"]),
            has_pause: has(&["pause", "paused"]),
            has_owner: has(&["owner", "getOwner"]),
            has_transfer_ownership: has(&["transferOwnership"]),
            has_withdraw: has(&["withdraw"]),
        }
    }

    pub fn count(&self) -> u32 {
        [
            self.has_approve,
            self.has_transfer_from,
            self.has_mint,
            self.has_burn,
            self.has_pause,
            self.has_owner,
            self.has_transfer_ownership,
            self.has_withdraw,
        ]
        .iter()
        .filter(|flag| **flag)
        .count() as u32
    }
}

/// Interface-only measurements
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceProfile {
    pub total_functions: usize,
    pub write_functions: usize,
    pub view_functions: usize,
    pub flags: RiskFlags,
}

impl InterfaceProfile {
    pub fn write_ratio(&self) -> f64 {
        self.write_functions as f64 / self.total_functions.max(1) as f64
    }
}

/// Classify the function descriptors of an interface
pub fn profile(abi: &[AbiItem]) -> InterfaceProfile {
    let functions: Vec<&AbiItem> = abi.iter().filter(|item| item.is_function()).collect();
    let view_functions = functions.iter().filter(|item| item.is_read_only()).count();
    let names: Vec<&str> = functions.iter().map(|item| item.name()).collect();

    InterfaceProfile {
        total_functions: functions.len(),
        write_functions: functions.len() - view_functions,
        view_functions,
        flags: RiskFlags::from_names(&names),
    }
}

/// Fixed-shape feature vector stored on the audit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureVector {
    pub total_functions: usize,
    pub write_functions: usize,
    pub view_functions: usize,
    pub write_ratio: f64,
    pub risky_flags: u32,
    pub is_contract: bool,
    pub code_len: usize,
    #[serde(flatten)]
    pub flags: RiskFlags,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decimals: Option<u8>,
    /// Decimal string; supplies routinely exceed u64
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_supply: Option<String>,
}

impl FeatureVector {
    /// Two-dimensional scorer input: (write_ratio, risky_flags)
    pub fn score_input(&self) -> ScoreInput {
        ScoreInput {
            write_ratio: self.write_ratio,
            risky_flags: f64::from(self.risky_flags),
        }
    }
}

/// Builds feature vectors using an injected chain probe
pub struct FeatureExtractor {
    probe: Arc<dyn ChainProbe>,
}

impl FeatureExtractor {
    pub fn new(probe: Arc<dyn ChainProbe>) -> Self {
        Self { probe }
    }

    /// Extract features for a resolved interface.
    ///
    /// Fails only if the code probe fails; metadata reads that fail are
    /// left out of the vector.
    pub async fn extract(
        &self,
        address: &ContractAddress,
        abi: &InterfaceDefinition,
    ) -> Result<FeatureVector> {
        let profile = profile(abi);
        let code_len = self.probe.code_size(address).await?;

        let name = self
            .read_metadata(address, abi, "name")
            .await
            .and_then(|v| v.as_str().map(str::to_string));
        let symbol = self
            .read_metadata(address, abi, "symbol")
            .await
            .and_then(|v| v.as_str().map(str::to_string));
        let decimals = self
            .read_metadata(address, abi, "decimals")
            .await
            .and_then(|v| v.as_u64())
            .and_then(|d| u8::try_from(d).ok());
        let total_supply = self
            .read_metadata(address, abi, "totalSupply")
            .await
            .and_then(|v| v.as_decimal().map(str::to_string));

        let features = FeatureVector {
            total_functions: profile.total_functions,
            write_functions: profile.write_functions,
            view_functions: profile.view_functions,
            write_ratio: profile.write_ratio(),
            risky_flags: profile.flags.count(),
            is_contract: code_len > 0,
            code_len,
            flags: profile.flags,
            name,
            symbol,
            decimals,
            total_supply,
        };

        debug!(
            address = %address,
            total_functions = features.total_functions,
            write_ratio = features.write_ratio,
            risky_flags = features.risky_flags,
            code_len,
            "Features extracted"
        );
        Ok(features)
    }

    async fn read_metadata(
        &self,
        address: &ContractAddress,
        abi: &InterfaceDefinition,
        function: &str,
    ) -> Option<AbiValue> {
        let callable = abi
            .iter()
            .any(|item| item.is_function() && item.name() == function && item.inputs.is_empty());
        if !callable {
            return None;
        }

        match self.probe.call_read_only(address, abi, function).await {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(address = %address, function, error = %e, "Metadata read failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::fixtures::{function, view_returning};
    use crate::chain::mock::MockProbe;
    use crate::error::AuditError;

    fn address() -> ContractAddress {
        ContractAddress::parse("0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed").unwrap()
    }

    #[test]
    fn test_profile_counts_and_flags() {
        let mut legacy = function("owner", "view");
        legacy.state_mutability = None;
        legacy.constant = Some(true);

        let abi = vec![
            function("approve", "nonpayable"),
            function("transferFrom", "nonpayable"),
            function("mintTo", "payable"),
            function("paused", "view"),
            legacy,
            view_returning("totalSupply", "uint256"),
        ];
        let profile = profile(&abi);

        assert_eq!(profile.total_functions, 6);
        assert_eq!(profile.write_functions, 3);
        assert_eq!(profile.view_functions, 3);
        assert!((profile.write_ratio() - 0.5).abs() < 1e-12);
        assert!(profile.flags.has_mint && profile.flags.has_pause && profile.flags.has_owner);
        assert!(!profile.flags.has_burn && !profile.flags.has_withdraw);
        assert_eq!(profile.flags.count(), 5);
    }

    #[test]
    fn test_empty_interface_ratio() {
        let profile = profile(&[]);
        assert_eq!(profile.total_functions, 0);
        assert_eq!(profile.write_ratio(), 0.0);
    }

    #[tokio::test]
    async fn test_partial_metadata_failure() {
        let abi = vec![
            view_returning("name", "string"),
            view_returning("symbol", "string"),
            view_returning("decimals", "uint8"),
        ];
        let probe = MockProbe::with_code(120)
            .value("name", AbiValue::String("Token".to_string()))
            .value("decimals", AbiValue::Uint("18".to_string()));
        let extractor = FeatureExtractor::new(Arc::new(probe));

        let features = extractor.extract(&address(), &abi).await.unwrap();
        assert_eq!(features.name.as_deref(), Some("Token"));
        assert!(features.symbol.is_none());
        assert_eq!(features.decimals, Some(18));
        assert!(features.is_contract);

        let json = serde_json::to_value(&features).unwrap();
        assert_eq!(json["name"], "Token");
        assert!(json.get("symbol").is_none());
        assert!(json.get("total_supply").is_none());
        assert_eq!(json["has_transfer_from"], false);
    }

    #[tokio::test]
    async fn test_code_probe_failure_is_fatal() {
        let probe = MockProbe {
            fail_code: true,
            ..Default::default()
        };
        let extractor = FeatureExtractor::new(Arc::new(probe));
        let err = extractor
            .extract(&address(), &vec![function("mint", "nonpayable")])
            .await
            .unwrap_err();
        assert!(matches!(err, AuditError::Rpc(_)));
    }

    #[tokio::test]
    async fn test_no_code_means_not_contract() {
        let extractor = FeatureExtractor::new(Arc::new(MockProbe::with_code(0)));
        let features = extractor
            .extract(&address(), &vec![function("withdraw", "nonpayable")])
            .await
            .unwrap();
        assert!(!features.is_contract);
        assert_eq!(features.risky_flags, 1);
        assert_eq!(features.score_input().risky_flags, 1.0);
    }
}
