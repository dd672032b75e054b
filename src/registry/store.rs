// src/registry/store.rs
//! Shared fleet registry
//!
//! A flat key/value namespace with last-writer-wins semantics. No
//! transactions and no compare-and-swap: protocol-level atomicity is
//! the caller's job. A store failure surfaces as `RegistryUnavailable`
//! and fails the current call fast; there is no caching or write-behind.

use crate::registry::record::{FleetRecord, InstanceRecord, SimulationRecord};
use crate::utils::errors::{FleetError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Fleet registry contract
#[async_trait]
pub trait Registry: Send + Sync {
    async fn put(&self, key: &str, record: &FleetRecord) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<FleetRecord>>;

    /// All records in key order
    async fn scan(&self) -> Result<Vec<(String, FleetRecord)>>;

    async fn delete(&self, keys: &[String]) -> Result<()>;

    /// Decoded instance records, in registry iteration order
    async fn scan_instances(&self) -> Result<Vec<InstanceRecord>> {
        Ok(self
            .scan()
            .await?
            .into_iter()
            .filter_map(|(_, record)| match record {
                FleetRecord::Instance(r) => Some(r),
                FleetRecord::Simulation(_) => None,
            })
            .collect())
    }

    /// Decoded simulation records, in registry iteration order
    async fn scan_simulations(&self) -> Result<Vec<SimulationRecord>> {
        Ok(self
            .scan()
            .await?
            .into_iter()
            .filter_map(|(_, record)| match record {
                FleetRecord::Simulation(r) => Some(r),
                FleetRecord::Instance(_) => None,
            })
            .collect())
    }
}

/// SQLite-backed registry
///
/// One `kv` table holding JSON-encoded tagged records.
pub struct SqliteRegistry {
    db: Arc<Mutex<Connection>>,
}

impl SqliteRegistry {
    /// Open (or create) the registry database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(|e| {
            FleetError::RegistryUnavailable(format!("Failed to open registry: {}", e))
        })?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                record TEXT NOT NULL
            )
            "#,
            [],
        )
        .map_err(|e| FleetError::RegistryUnavailable(format!("Schema creation failed: {}", e)))?;

        info!("Registry opened at {:?}", path.as_ref());

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl Registry for SqliteRegistry {
    async fn put(&self, key: &str, record: &FleetRecord) -> Result<()> {
        let encoded = serde_json::to_string(record)
            .map_err(|e| FleetError::InvalidPayload(format!("Failed to encode record: {}", e)))?;

        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO kv (key, record) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET record = excluded.record",
            params![key, encoded],
        )
        .map_err(|e| FleetError::RegistryUnavailable(format!("Put failed: {}", e)))?;

        debug!("Registry put: {}", key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<FleetRecord>> {
        let db = self.db.lock().await;
        let encoded: Option<String> = db
            .query_row("SELECT record FROM kv WHERE key = ?", params![key], |row| {
                row.get(0)
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(FleetError::RegistryUnavailable(format!(
                    "Get failed: {}",
                    other
                ))),
            })?;

        match encoded {
            Some(raw) => {
                let record = serde_json::from_str(&raw).map_err(|e| {
                    FleetError::InvalidPayload(format!("Undecodable record at '{}': {}", key, e))
                })?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn scan(&self) -> Result<Vec<(String, FleetRecord)>> {
        let db = self.db.lock().await;
        let mut stmt = db
            .prepare("SELECT key, record FROM kv ORDER BY key")
            .map_err(|e| FleetError::RegistryUnavailable(format!("Scan failed: {}", e)))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| FleetError::RegistryUnavailable(format!("Scan failed: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| FleetError::RegistryUnavailable(format!("Scan failed: {}", e)))?;

        let mut records = Vec::with_capacity(rows.len());
        for (key, raw) in rows {
            match serde_json::from_str(&raw) {
                Ok(record) => records.push((key, record)),
                Err(e) => {
                    // Tolerate foreign rows rather than failing the scan
                    warn!("Skipping undecodable record at '{}': {}", key, e);
                }
            }
        }

        Ok(records)
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let db = self.db.lock().await;
        for key in keys {
            db.execute("DELETE FROM kv WHERE key = ?", params![key])
                .map_err(|e| FleetError::RegistryUnavailable(format!("Delete failed: {}", e)))?;
            debug!("Registry delete: {}", key);
        }
        Ok(())
    }
}

/// In-memory registry for tests and single-process runs
#[derive(Default)]
pub struct MemoryRegistry {
    records: DashMap<String, FleetRecord>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn put(&self, key: &str, record: &FleetRecord) -> Result<()> {
        self.records.insert(key.to_string(), record.clone());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<FleetRecord>> {
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    async fn scan(&self) -> Result<Vec<(String, FleetRecord)>> {
        let mut records: Vec<(String, FleetRecord)> = self
            .records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.records.remove(key);
        }
        Ok(())
    }
}
