// src/observability/mod.rs
//! Tracing and metrics initialization
//!
//! Both binaries call these once at startup, before any other component
//! is constructed.

use crate::utils::errors::{FleetError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber
///
/// Honors `RUST_LOG`; defaults to `info` when unset.
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| FleetError::ConfigError(format!("Failed to init tracing: {}", e)))?;

    Ok(())
}

/// Install the Prometheus metrics exporter on the given port
///
/// A port of 0 disables the exporter; `metrics` macro calls then hit
/// the no-op recorder.
pub fn init_metrics(port: u16) -> Result<()> {
    if port == 0 {
        return Ok(());
    }

    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| FleetError::ConfigError(format!("Failed to install metrics exporter: {}", e)))?;

    Ok(())
}
