// src/bin/instance.rs
//! Simfleet instance service
//!
//! One worker: supervises a single simulation subprocess, forwards its
//! updates, and reports its own health to the orchestrator.

use anyhow::Result;
use simfleet_engine::instance::pipeline::LogBroker;
use simfleet_engine::instance::reporter::{spawn_liveness_loop, spawn_report_loop, ReporterConfig};
use simfleet_engine::instance::server::InstanceServer;
use simfleet_engine::instance::state::InstanceState;
use simfleet_engine::instance::supervisor::{ProcessSupervisor, SupervisorConfig};
use simfleet_engine::observability::{init_metrics, init_tracing};
use simfleet_engine::utils::config::FleetConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    info!("Starting Simfleet instance v{}", env!("CARGO_PKG_VERSION"));

    let config = FleetConfig::load()?;
    info!("Configuration loaded: {:?}", config);

    init_metrics(config.server.metrics_port)?;

    let supervisor = ProcessSupervisor::new(SupervisorConfig {
        command: config.instance.runner_command.clone(),
        args: config.instance.runner_args.clone(),
        work_dir: PathBuf::from(&config.instance.work_dir),
    });

    // The real deployment plugs a message-broker producer in here
    let broker = Arc::new(LogBroker);

    let state = InstanceState::new(
        supervisor,
        broker,
        Duration::from_millis(config.instance.drain_grace_period_ms),
    );

    spawn_report_loop(
        Arc::clone(&state),
        ReporterConfig {
            key: config.instance.key.clone(),
            orchestrator_url: config.instance.orchestrator_url.clone(),
            announce_period: Duration::from_secs(config.instance.announce_period_secs),
        },
    );
    spawn_liveness_loop(
        Arc::clone(&state),
        Duration::from_secs(config.instance.liveness_period_secs),
    );

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let server = InstanceServer::bind(Arc::clone(&state), addr).await?;

    tokio::select! {
        result = server.serve() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, stopping");
            // Leave nothing orphaned behind the service
            if state.status().await.can_start() {
                info!("No simulation running");
            } else if let Err(e) = state.kill().await {
                error!("Failed to stop simulation on shutdown: {}", e);
            }
        }
    }

    Ok(())
}
