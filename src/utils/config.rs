// src/utils/config.rs
//! Layered configuration
//!
//! Defaults are defined in code and can be overridden by an optional
//! `simfleet` config file (YAML/TOML/JSON) and `SIMFLEET_`-prefixed
//! environment variables (`SIMFLEET_INSTANCE__KEY=worker-3` maps to
//! `instance.key`).

use crate::utils::errors::{FleetError, Result};
use serde::Deserialize;

/// Top-level configuration for both services
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FleetConfig {
    pub server: ServerConfig,
    pub registry: RegistryConfig,
    pub orchestrator: OrchestratorConfig,
    pub instance: InstanceConfig,
}

/// HTTP server settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Prometheus exporter port; 0 disables the exporter
    pub metrics_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            metrics_port: 0,
        }
    }
}

/// Shared registry store settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Path to the registry database file
    pub path: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: "simfleet-registry.db".to_string(),
        }
    }
}

/// Orchestrator protocol settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Attempt budget for the creation and deletion protocols
    pub max_attempts: u32,

    /// Timeout for create/delete calls to an instance, in seconds
    pub request_timeout_secs: u64,

    /// Timeout for health probes, in seconds
    pub probe_timeout_secs: u64,

    /// Port every instance API listens on
    pub instance_port: u16,

    /// Base URL of the backup collaborator
    pub backup_url: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            request_timeout_secs: 10,
            probe_timeout_secs: 2,
            instance_port: 8000,
            backup_url: "http://localhost:8100".to_string(),
        }
    }
}

/// Per-worker instance settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Stable identity of this worker; doubles as its hostname in the
    /// fleet, so the orchestrator can reach the API at `http://{key}`
    pub key: String,

    /// Base URL of the orchestrator for self-reports
    pub orchestrator_url: String,

    /// Period between self-reports, in seconds
    pub announce_period_secs: u64,

    /// Period between subprocess liveness checks, in seconds
    pub liveness_period_secs: u64,

    /// Grace period for draining the update queues on kill, in milliseconds
    pub drain_grace_period_ms: u64,

    /// Command used to launch the simulation runner subprocess
    pub runner_command: String,

    /// Arguments passed to the runner command
    pub runner_args: Vec<String>,

    /// Directory where per-simulation spawn files are written
    pub work_dir: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            key: "localhost".to_string(),
            orchestrator_url: "http://localhost:8000".to_string(),
            announce_period_secs: 10,
            liveness_period_secs: 5,
            drain_grace_period_ms: 2000,
            runner_command: "python3".to_string(),
            runner_args: vec!["-u".to_string(), "main.py".to_string()],
            work_dir: "/tmp/simfleet".to_string(),
        }
    }
}

impl FleetConfig {
    /// Load configuration from defaults, optional file, and environment
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("simfleet").required(false))
            .add_source(config::Environment::with_prefix("SIMFLEET").separator("__"))
            .build()
            .map_err(|e| FleetError::ConfigError(format!("Failed to build config: {}", e)))?;

        settings
            .try_deserialize()
            .map_err(|e| FleetError::ConfigError(format!("Failed to deserialize config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FleetConfig::default();
        assert_eq!(config.orchestrator.max_attempts, 3);
        assert_eq!(config.orchestrator.instance_port, 8000);
        assert_eq!(config.instance.announce_period_secs, 10);
        assert_eq!(config.server.port, 8000);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: FleetConfig =
            serde_json::from_str(r#"{"orchestrator": {"max_attempts": 5}}"#).unwrap();
        assert_eq!(config.orchestrator.max_attempts, 5);
        // Untouched sections keep their defaults
        assert_eq!(config.orchestrator.probe_timeout_secs, 2);
        assert_eq!(config.instance.key, "localhost");
    }
}
