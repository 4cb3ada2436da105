//! Contract auditor
//!
//! Asynchronous risk audits for deployed smart contracts. An audit job
//! resolves the contract's interface definition (inline, file, cache or
//! block-explorer registry), probes the chain for bytecode and token
//! metadata, reduces the interface to a two-dimensional feature vector and
//! scores it with an isolation-forest anomaly model.
//!
//! ## Architecture
//!
//! ```text
//! AuditService ──enqueue──► WorkerPool ──► AuditOrchestrator
//!      │                                     │
//!      │                      AbiResolver ◄──┼──► FeatureExtractor ──► ChainProbe
//!      │                           │         │
//!      └──────── Database ◄────────┴─────────┴──► RiskScorer ──► AnomalyOracle
//! ```
//!
//! Jobs, audits and cached ABIs live in one SQLite file.

pub mod abi;
pub mod address;
pub mod chain;
pub mod config;
pub mod db;
pub mod error;
pub mod features;
pub mod logging;
pub mod orchestrator;
pub mod queue;
pub mod scoring;
pub mod service;

pub use address::ContractAddress;
pub use config::{Args, Command};
pub use db::Database;
pub use error::{AuditError, Result};
pub use orchestrator::{AuditOrchestrator, AuditOutcome};
pub use service::{AuditService, EnqueuedJob};
