//! ABI resolution chain
//!
//! ```text
//! inline → file → forced registry refresh → cache → registry fallback
//! ```
//!
//! Steps run in that order and the first one that produces a definition
//! wins. A step either declines (`Ok(None)`), answers, or fails the whole
//! resolution.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use super::cache::AbiCacheStore;
use super::parse::{normalize_payload, normalize_text};
use super::registry::{chain_id_for, AbiRegistry, DEFAULT_NETWORK};
use super::{InterfaceDefinition, Provenance};
use crate::address::ContractAddress;
use crate::error::{AuditError, Result};

/// Caller-supplied resolution hints
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Definition supplied with the request, used verbatim
    pub inline: Option<InterfaceDefinition>,
    /// ABI file on disk
    pub file_path: Option<PathBuf>,
    /// Skip the cache and refetch from the registry
    pub force_refresh: bool,
    /// Also persist inline/file definitions as `manual`
    pub cache_manual: bool,
}

impl ResolveOptions {
    pub fn refresh(force_refresh: bool) -> Self {
        Self {
            force_refresh,
            ..Self::default()
        }
    }
}

/// A resolved definition and where it came from
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedAbi {
    pub abi: InterfaceDefinition,
    pub provenance: Provenance,
}

/// Resolution step, in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Inline,
    File,
    ForcedRefresh,
    Cache,
    RegistryFallback,
}

const RESOLUTION_ORDER: [Step; 5] = [
    Step::Inline,
    Step::File,
    Step::ForcedRefresh,
    Step::Cache,
    Step::RegistryFallback,
];

/// Resolution statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolutionStats {
    pub resolutions: u64,
    pub inline_hits: u64,
    pub file_hits: u64,
    pub cache_hits: u64,
    pub registry_fetches: u64,
    pub failures: u64,
}

/// Resolves contract ABIs through the ordered step chain.
pub struct AbiResolver {
    cache: AbiCacheStore,
    registry: Option<Arc<dyn AbiRegistry>>,
    default_network: String,
    stats: RwLock<ResolutionStats>,
}

impl AbiResolver {
    pub fn new(cache: AbiCacheStore, registry: Option<Arc<dyn AbiRegistry>>) -> Self {
        info!(registry = registry.is_some(), "AbiResolver initialized");
        Self {
            cache,
            registry,
            default_network: DEFAULT_NETWORK.to_string(),
            stats: RwLock::new(ResolutionStats::default()),
        }
    }

    /// Network used when a request names an unknown one
    pub fn with_default_network(mut self, network: impl Into<String>) -> Self {
        self.default_network = network.into();
        self
    }

    pub fn cache(&self) -> &AbiCacheStore {
        &self.cache
    }

    /// Resolve the ABI for `address` on `network`.
    pub async fn resolve(
        &self,
        address: &ContractAddress,
        network: &str,
        options: &ResolveOptions,
    ) -> Result<ResolvedAbi> {
        self.bump(|s| s.resolutions += 1);

        for step in RESOLUTION_ORDER {
            match self.attempt(step, address, network, options).await {
                Ok(Some(resolved)) => {
                    debug!(
                        address = %address,
                        network,
                        step = ?step,
                        provenance = %resolved.provenance,
                        functions = resolved.abi.len(),
                        "ABI resolved"
                    );
                    if options.cache_manual
                        && matches!(step, Step::Inline | Step::File)
                    {
                        self.cache.upsert(
                            address.checksum(),
                            network,
                            &resolved.abi,
                            Provenance::Manual,
                        )?;
                    }
                    return Ok(resolved);
                }
                Ok(None) => continue,
                Err(e) => {
                    self.bump(|s| s.failures += 1);
                    warn!(address = %address, network, step = ?step, error = %e, "ABI resolution failed");
                    return Err(e);
                }
            }
        }

        self.bump(|s| s.failures += 1);
        Err(AuditError::AbiUnresolved {
            address: address.checksum().to_string(),
            network: network.to_string(),
        })
    }

    async fn attempt(
        &self,
        step: Step,
        address: &ContractAddress,
        network: &str,
        options: &ResolveOptions,
    ) -> Result<Option<ResolvedAbi>> {
        match step {
            Step::Inline => Ok(options
                .inline
                .as_ref()
                .filter(|abi| !abi.is_empty())
                .map(|abi| {
                    self.bump(|s| s.inline_hits += 1);
                    ResolvedAbi {
                        abi: abi.clone(),
                        provenance: Provenance::Inline,
                    }
                })),
            Step::File => self.from_file(options).await,
            Step::ForcedRefresh if options.force_refresh => {
                self.fetch_and_store(address, network).await
            }
            Step::ForcedRefresh => Ok(None),
            Step::Cache => {
                let record = self.cache.get(address.checksum(), network)?;
                Ok(record.map(|record| {
                    self.bump(|s| s.cache_hits += 1);
                    ResolvedAbi {
                        abi: record.abi,
                        provenance: record.provenance,
                    }
                }))
            }
            Step::RegistryFallback => self.fetch_and_store(address, network).await,
        }
    }

    async fn from_file(&self, options: &ResolveOptions) -> Result<Option<ResolvedAbi>> {
        let Some(path) = options.file_path.as_ref() else {
            return Ok(None);
        };

        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "ABI file not found, skipping");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let abi = normalize_text(&text)
            .map_err(|e| AuditError::AbiParse(format!("{}: {e}", path.display())))?;
        self.bump(|s| s.file_hits += 1);
        Ok(Some(ResolvedAbi {
            abi,
            provenance: Provenance::File,
        }))
    }

    async fn fetch_and_store(
        &self,
        address: &ContractAddress,
        network: &str,
    ) -> Result<Option<ResolvedAbi>> {
        let Some(registry) = self.registry.as_ref() else {
            return Ok(None);
        };

        let chain_id = chain_id_for(network, &self.default_network);
        let payload = registry.fetch_abi(address, chain_id).await?;
        let abi = normalize_payload(&payload)?;
        self.bump(|s| s.registry_fetches += 1);

        self.cache
            .upsert(address.checksum(), network, &abi, Provenance::RemoteRegistry)?;
        Ok(Some(ResolvedAbi {
            abi,
            provenance: Provenance::RemoteRegistry,
        }))
    }

    /// Snapshot of resolution statistics
    pub fn stats(&self) -> ResolutionStats {
        self.stats
            .read()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }

    fn bump(&self, f: impl FnOnce(&mut ResolutionStats)) {
        if let Ok(mut stats) = self.stats.write() {
            f(&mut stats);
        }
    }
}
