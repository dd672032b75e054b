// src/bin/orchestrator.rs
//! Simfleet orchestrator service
//!
//! The fleet's control plane: partitions simulations across workers,
//! runs the creation/deletion protocol, and ingests worker self-reports.

use anyhow::Result;
use simfleet_engine::observability::{init_metrics, init_tracing};
use simfleet_engine::orchestrator::backup::HttpBackupStore;
use simfleet_engine::orchestrator::client::HttpInstanceClient;
use simfleet_engine::orchestrator::fleet::FleetService;
use simfleet_engine::orchestrator::server::OrchestratorServer;
use simfleet_engine::registry::store::SqliteRegistry;
use simfleet_engine::utils::config::FleetConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    info!("Starting Simfleet orchestrator v{}", env!("CARGO_PKG_VERSION"));

    let config = FleetConfig::load()?;
    info!("Configuration loaded: {:?}", config);

    init_metrics(config.server.metrics_port)?;

    let registry = Arc::new(SqliteRegistry::open(&config.registry.path)?);
    let backup = Arc::new(HttpBackupStore::new(
        config.orchestrator.backup_url.clone(),
        Duration::from_secs(config.orchestrator.request_timeout_secs),
    ));
    let instances = Arc::new(HttpInstanceClient::new(
        config.orchestrator.instance_port,
        Duration::from_secs(config.orchestrator.request_timeout_secs),
        Duration::from_secs(config.orchestrator.probe_timeout_secs),
    ));

    let service = Arc::new(FleetService::new(
        registry,
        backup,
        instances,
        config.orchestrator.max_attempts,
    ));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let server = OrchestratorServer::bind(service, addr).await?;

    tokio::select! {
        result = server.serve() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, stopping");
        }
    }

    Ok(())
}
