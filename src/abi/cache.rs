//! SQLite-backed ABI cache
//!
//! One row per (address, network). Addresses are checksum-validated and
//! stored lowercase so lookups ignore casing.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use super::{InterfaceDefinition, Provenance};
use crate::address::ContractAddress;
use crate::db::{parsed_column, Database};
use crate::error::{AuditError, Result};

/// Cached interface definition
#[derive(Debug, Clone, Serialize)]
pub struct AbiCacheRecord {
    pub id: i64,
    pub address: String,
    pub network: String,
    pub provenance: Provenance,
    pub abi: InterfaceDefinition,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AbiCacheRecord {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let abi_text: String = row.get("abi")?;
        let abi = serde_json::from_str(&abi_text).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?;

        Ok(Self {
            id: row.get("id")?,
            address: row.get("address")?,
            network: row.get("network")?,
            provenance: parsed_column(row, "source")?,
            abi,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Keyed ABI store over the shared database handle
#[derive(Clone)]
pub struct AbiCacheStore {
    db: Arc<Database>,
}

impl AbiCacheStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Look up the cached definition for an address on a network
    pub fn get(&self, address: &str, network: &str) -> Result<Option<AbiCacheRecord>> {
        let key = ContractAddress::parse(address)?.lookup_key();
        let network = normalize_network(network);

        self.db.with_conn(|conn| {
            let record = conn
                .query_row(
                    "SELECT * FROM contract_abis WHERE address = ?1 AND network = ?2",
                    params![key, network],
                    AbiCacheRecord::from_row,
                )
                .optional()?;
            Ok(record)
        })
    }

    /// Insert or update the definition for (address, network).
    ///
    /// An existing row keeps its `created_at`; definition, provenance and
    /// `updated_at` are replaced. Concurrent upserts for the same key are
    /// last-write-wins.
    pub fn upsert(
        &self,
        address: &str,
        network: &str,
        abi: &InterfaceDefinition,
        provenance: Provenance,
    ) -> Result<AbiCacheRecord> {
        let key = ContractAddress::parse(address)?.lookup_key();
        let network = normalize_network(network);
        let abi_text = serde_json::to_string(abi)?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO contract_abis (address, network, source, abi, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(address, network) DO UPDATE SET
                    source = excluded.source,
                    abi = excluded.abi,
                    updated_at = excluded.updated_at",
                params![key, network, provenance.as_str(), abi_text, Utc::now()],
            )?;

            debug!(address = %key, network = %network, provenance = %provenance, "ABI cached");

            conn.query_row(
                "SELECT * FROM contract_abis WHERE address = ?1 AND network = ?2",
                params![key, network],
                AbiCacheRecord::from_row,
            )
            .optional()?
            .ok_or_else(|| AuditError::Internal(format!("ABI cache row for {key} vanished")))
        })
    }

    /// Number of rows cached for an address across casings (diagnostics, tests)
    pub fn count(&self, address: &str, network: &str) -> Result<i64> {
        let key = ContractAddress::parse(address)?.lookup_key();
        let network = normalize_network(network);
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM contract_abis WHERE address = ?1 AND network = ?2",
                params![key, network],
                |row| row.get(0),
            )?)
        })
    }
}

fn normalize_network(network: &str) -> String {
    network.trim().to_ascii_lowercase()
}
