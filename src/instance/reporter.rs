// src/instance/reporter.rs
//! Instance background loops
//!
//! Two periodic tasks run for the lifetime of the worker: the
//! self-report loop pushes the current `InstanceRecord` to the
//! orchestrator, and the liveness loop checks the subprocess. Transport
//! failures are logged and the loops keep going; a worker that cannot
//! reach the orchestrator still supervises its simulation.

use crate::instance::state::InstanceState;
use bytes::Bytes;
use http_body_util::Full;
use hyper::{Method, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Settings for the self-report loop
#[derive(Debug, Clone)]
pub struct ReporterConfig {
    /// This worker's identity
    pub key: String,

    /// Orchestrator base URL
    pub orchestrator_url: String,

    /// Announcement period
    pub announce_period: Duration,
}

/// Periodically push this worker's state to the orchestrator
pub fn spawn_report_loop(state: Arc<InstanceState>, config: ReporterConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let http: Client<HttpConnector, Full<Bytes>> =
            Client::builder(TokioExecutor::new()).build_http();
        let url = format!(
            "{}/instances/{}/state",
            config.orchestrator_url, config.key
        );

        // Spread a fleet-wide restart over the announce window
        let period_ms = config.announce_period.as_millis().max(1) as u64;
        let jitter = rand::thread_rng().gen_range(0..period_ms);
        tokio::time::sleep(Duration::from_millis(jitter)).await;

        let mut interval = tokio::time::interval(config.announce_period);
        loop {
            interval.tick().await;

            let record = state.current_record(&config.key).await;
            let body = match serde_json::to_vec(&record) {
                Ok(body) => body,
                Err(e) => {
                    warn!("Failed to encode self-report: {}", e);
                    continue;
                }
            };

            let request = Request::builder()
                .method(Method::PUT)
                .uri(&url)
                .header("content-type", "application/json")
                .body(Full::new(Bytes::from(body)));
            let request = match request {
                Ok(request) => request,
                Err(e) => {
                    warn!("Failed to build self-report request: {}", e);
                    continue;
                }
            };

            match http.request(request).await {
                Ok(response) if response.status().is_success() => {
                    debug!("Self-report delivered ({:?})", record.status);
                }
                Ok(response) => {
                    warn!("Self-report refused with status {}", response.status());
                }
                Err(e) => {
                    warn!("Self-report failed, will retry next period: {}", e);
                }
            }
        }
    })
}

/// Periodically check whether the subprocess is still alive
pub fn spawn_liveness_loop(state: Arc<InstanceState>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            state.verify_liveness().await;
        }
    })
}
