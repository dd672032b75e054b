// src/orchestrator/backup.rs
//! Backup collaborator seam
//!
//! Graph backups live in an external data-processor service; the
//! orchestrator only needs save/fetch. A save failure aborts creation
//! before any instance is contacted.

use crate::api::CreateAgent;
use crate::utils::errors::{FleetError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// Backup store contract
#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Persist the initial graph of a simulation
    async fn save(&self, simulation_id: &str, graph: &[CreateAgent]) -> Result<()>;

    /// Fetch the most recent backup
    ///
    /// The payload is whatever the data processor accumulated while the
    /// simulation ran; callers extract the fields they need.
    async fn fetch(&self, simulation_id: &str) -> Result<Vec<serde_json::Value>>;
}

/// HTTP client for the external data-processor backup API
pub struct HttpBackupStore {
    http: Client<HttpConnector, Full<Bytes>>,
    base_url: String,
    timeout: Duration,
}

impl HttpBackupStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: Client::builder(TokioExecutor::new()).build_http(),
            base_url: base_url.into(),
            timeout,
        }
    }

    async fn request(&self, method: Method, path: &str, body: Bytes) -> Result<(StatusCode, Bytes)> {
        let req = Request::builder()
            .method(method)
            .uri(format!("{}{}", self.base_url, path))
            .header("content-type", "application/json")
            .body(Full::new(body))
            .map_err(|e| FleetError::BackupPersistenceFailed(format!("Request build error: {}", e)))?;

        let response = tokio::time::timeout(self.timeout, self.http.request(req))
            .await
            .map_err(|_| FleetError::BackupPersistenceFailed("backup call timed out".into()))?
            .map_err(|e| FleetError::BackupPersistenceFailed(e.to_string()))?;

        let (parts, body) = response.into_parts();
        let bytes = body
            .collect()
            .await
            .map_err(|e| FleetError::BackupPersistenceFailed(format!("Body read error: {}", e)))?
            .to_bytes();

        Ok((parts.status, bytes))
    }
}

#[async_trait]
impl BackupStore for HttpBackupStore {
    async fn save(&self, simulation_id: &str, graph: &[CreateAgent]) -> Result<()> {
        let body = serde_json::to_vec(graph)
            .map_err(|e| FleetError::BackupPersistenceFailed(format!("Encode error: {}", e)))?;

        let path = format!("/simulations/{}/backup", simulation_id);
        let (status, body) = self.request(Method::POST, &path, Bytes::from(body)).await?;

        if status != StatusCode::OK {
            return Err(FleetError::BackupPersistenceFailed(format!(
                "[status {}] {}",
                status,
                String::from_utf8_lossy(&body)
            )));
        }

        Ok(())
    }

    async fn fetch(&self, simulation_id: &str) -> Result<Vec<serde_json::Value>> {
        let path = format!("/simulations/{}/backup", simulation_id);
        let (status, body) = self.request(Method::GET, &path, Bytes::new()).await?;

        if status != StatusCode::OK {
            return Err(FleetError::BackupPersistenceFailed(format!(
                "[status {}] {}",
                status,
                String::from_utf8_lossy(&body)
            )));
        }

        serde_json::from_slice(&body)
            .map_err(|e| FleetError::BackupPersistenceFailed(format!("Undecodable backup: {}", e)))
    }
}

/// In-memory backup store for tests and single-process runs
#[derive(Default)]
pub struct MemoryBackupStore {
    backups: Mutex<HashMap<String, Vec<serde_json::Value>>>,
}

impl MemoryBackupStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BackupStore for MemoryBackupStore {
    async fn save(&self, simulation_id: &str, graph: &[CreateAgent]) -> Result<()> {
        let values = graph
            .iter()
            .map(|agent| serde_json::to_value(agent))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| FleetError::BackupPersistenceFailed(format!("Encode error: {}", e)))?;

        self.backups
            .lock()
            .insert(simulation_id.to_string(), values);
        Ok(())
    }

    async fn fetch(&self, simulation_id: &str) -> Result<Vec<serde_json::Value>> {
        self.backups
            .lock()
            .get(simulation_id)
            .cloned()
            .ok_or_else(|| {
                FleetError::BackupPersistenceFailed(format!(
                    "no backup for simulation '{}'",
                    simulation_id
                ))
            })
    }
}

/// Rebuild an initial graph from a backup payload
///
/// Only identity, type, and connections are restored; runtime state
/// (floats, enums, in-flight messages) is deliberately dropped.
/// Connections may arrive either as a plain list or keyed lists,
/// depending on how far the simulation progressed before backup.
pub fn restore_graph(backup: &[serde_json::Value]) -> Result<Vec<CreateAgent>> {
    backup
        .iter()
        .map(|value| {
            let jid = value
                .get("jid")
                .and_then(|v| v.as_str())
                .ok_or_else(|| FleetError::BackupPersistenceFailed("agent without jid".into()))?
                .to_string();

            let agent_type = value
                .get("type")
                .and_then(|v| v.as_str())
                .ok_or_else(|| FleetError::BackupPersistenceFailed("agent without type".into()))?
                .to_string();

            let connections = match value.get("connections") {
                Some(serde_json::Value::Array(items)) => items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect(),
                Some(serde_json::Value::Object(map)) => map
                    .values()
                    .filter_map(|v| v.as_array())
                    .flatten()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect(),
                _ => Vec::new(),
            };

            Ok(CreateAgent {
                jid,
                agent_type,
                connections,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryBackupStore::new();
        let graph = vec![CreateAgent {
            jid: "agent_0".into(),
            agent_type: "common".into(),
            connections: vec!["agent_1".into()],
        }];

        store.save("abc", &graph).await.unwrap();
        let backup = store.fetch("abc").await.unwrap();
        assert_eq!(restore_graph(&backup).unwrap(), graph);
    }

    #[tokio::test]
    async fn test_fetch_missing_backup() {
        let store = MemoryBackupStore::new();
        assert!(store.fetch("nope").await.is_err());
    }

    #[test]
    fn test_restore_drops_runtime_state() {
        let backup = vec![json!({
            "jid": "agent_0",
            "type": "common",
            "connections": ["agent_1", "agent_2"],
            "floats": {"susceptibility": 61.5},
            "enums": {"state": "believer"},
            "messages": {"agent_1": []}
        })];

        let graph = restore_graph(&backup).unwrap();
        assert_eq!(graph.len(), 1);
        assert_eq!(graph[0].jid, "agent_0");
        assert_eq!(graph[0].connections, vec!["agent_1", "agent_2"]);
    }

    #[test]
    fn test_restore_keyed_connections() {
        let backup = vec![json!({
            "jid": "agent_0",
            "type": "common",
            "connections": {"followers": ["agent_1"], "following": ["agent_2"]}
        })];

        let graph = restore_graph(&backup).unwrap();
        assert_eq!(graph[0].connections, vec!["agent_1", "agent_2"]);
    }

    #[test]
    fn test_restore_rejects_malformed_agent() {
        let backup = vec![json!({"type": "common"})];
        assert!(restore_graph(&backup).is_err());
    }
}
