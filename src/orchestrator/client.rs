// src/orchestrator/client.rs
//! Instance API client
//!
//! The orchestrator reaches each worker at `http://{key}:{port}`; the
//! instance key doubles as its hostname. Every call is bounded by a
//! timeout, and a timeout is classified the same as an explicit
//! "unavailable" signal for quarantine purposes.

use crate::api::{CreateShardData, DeletedShard};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// Classified outcome of one call to an instance
///
/// An internal enum, deliberately not a transport status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The instance responded as expected
    Ok,
    /// Transport-level failure: connection refused, DNS, reset
    Unreachable,
    /// The instance responded, but refused the request
    Rejected,
    /// The call exceeded its deadline
    Timeout,
}

impl ProbeOutcome {
    /// Whether this outcome counts as an "unavailable" signal during
    /// quarantine probing
    pub fn is_unavailable(&self) -> bool {
        !matches!(self, ProbeOutcome::Ok)
    }
}

/// Per-instance failure captured during a creation/deletion attempt
///
/// Ephemeral: produced and consumed within the same request's retry
/// loop, never persisted.
#[derive(Debug, Clone)]
pub struct InstanceErrorData {
    pub key: String,
    pub outcome: ProbeOutcome,
    pub info: String,
}

/// Per-instance endpoints used by the orchestrator protocol
#[async_trait]
pub trait InstanceApi: Send + Sync {
    /// `POST /simulation` — place a shard on the instance
    async fn create_shard(
        &self,
        key: &str,
        shard: &CreateShardData,
    ) -> std::result::Result<(), InstanceErrorData>;

    /// `DELETE /simulation` — stop whatever the instance is running;
    /// returns the simulation id that was running
    async fn delete_shard(&self, key: &str) -> std::result::Result<String, InstanceErrorData>;

    /// `GET /healthcheck` — classify the instance's availability
    async fn probe_health(&self, key: &str) -> ProbeOutcome;
}

/// HTTP implementation of [`InstanceApi`]
pub struct HttpInstanceClient {
    http: Client<HttpConnector, Full<Bytes>>,
    instance_port: u16,
    request_timeout: Duration,
    probe_timeout: Duration,
}

enum Transport {
    Response(StatusCode, Bytes),
    Unreachable(String),
    Timeout,
}

impl HttpInstanceClient {
    pub fn new(instance_port: u16, request_timeout: Duration, probe_timeout: Duration) -> Self {
        let http = Client::builder(TokioExecutor::new()).build_http();
        Self {
            http,
            instance_port,
            request_timeout,
            probe_timeout,
        }
    }

    fn url(&self, key: &str, path: &str) -> String {
        format!("http://{}:{}{}", key, self.instance_port, path)
    }

    async fn request(
        &self,
        method: Method,
        url: String,
        body: Bytes,
        deadline: Duration,
    ) -> Transport {
        let req = match Request::builder()
            .method(method)
            .uri(&url)
            .header("content-type", "application/json")
            .body(Full::new(body))
        {
            Ok(req) => req,
            Err(e) => return Transport::Unreachable(format!("Request build error: {}", e)),
        };

        let response = match tokio::time::timeout(deadline, self.http.request(req)).await {
            Err(_) => return Transport::Timeout,
            Ok(Err(e)) => return Transport::Unreachable(e.to_string()),
            Ok(Ok(response)) => response,
        };

        let (parts, body) = response.into_parts();
        match tokio::time::timeout(deadline, body.collect()).await {
            Err(_) => Transport::Timeout,
            Ok(Err(e)) => Transport::Unreachable(format!("Body read error: {}", e)),
            Ok(Ok(collected)) => Transport::Response(parts.status, collected.to_bytes()),
        }
    }
}

#[async_trait]
impl InstanceApi for HttpInstanceClient {
    async fn create_shard(
        &self,
        key: &str,
        shard: &CreateShardData,
    ) -> std::result::Result<(), InstanceErrorData> {
        let body = serde_json::to_vec(shard).map_err(|e| InstanceErrorData {
            key: key.to_string(),
            outcome: ProbeOutcome::Rejected,
            info: format!("Failed to encode shard: {}", e),
        })?;

        debug!("Placing shard of {} agents on {}", shard.agent_data.len(), key);

        let url = self.url(key, "/simulation");
        match self
            .request(Method::POST, url, Bytes::from(body), self.request_timeout)
            .await
        {
            Transport::Response(status, _) if status == StatusCode::CREATED => Ok(()),
            Transport::Response(status, body) => Err(InstanceErrorData {
                key: key.to_string(),
                outcome: ProbeOutcome::Rejected,
                info: format!("[status {}] {}", status, String::from_utf8_lossy(&body)),
            }),
            Transport::Unreachable(info) => Err(InstanceErrorData {
                key: key.to_string(),
                outcome: ProbeOutcome::Unreachable,
                info,
            }),
            Transport::Timeout => Err(InstanceErrorData {
                key: key.to_string(),
                outcome: ProbeOutcome::Timeout,
                info: "create timed out".to_string(),
            }),
        }
    }

    async fn delete_shard(&self, key: &str) -> std::result::Result<String, InstanceErrorData> {
        let url = self.url(key, "/simulation");
        match self
            .request(Method::DELETE, url, Bytes::new(), self.request_timeout)
            .await
        {
            Transport::Response(status, body) if status == StatusCode::OK => {
                let deleted: DeletedShard =
                    serde_json::from_slice(&body).map_err(|e| InstanceErrorData {
                        key: key.to_string(),
                        outcome: ProbeOutcome::Rejected,
                        info: format!("Undecodable delete response: {}", e),
                    })?;
                Ok(deleted.simulation_id)
            }
            Transport::Response(status, body) => Err(InstanceErrorData {
                key: key.to_string(),
                outcome: ProbeOutcome::Rejected,
                info: format!("[status {}] {}", status, String::from_utf8_lossy(&body)),
            }),
            Transport::Unreachable(info) => Err(InstanceErrorData {
                key: key.to_string(),
                outcome: ProbeOutcome::Unreachable,
                info,
            }),
            Transport::Timeout => Err(InstanceErrorData {
                key: key.to_string(),
                outcome: ProbeOutcome::Timeout,
                info: "delete timed out".to_string(),
            }),
        }
    }

    async fn probe_health(&self, key: &str) -> ProbeOutcome {
        let url = self.url(key, "/healthcheck");
        match self
            .request(Method::GET, url, Bytes::new(), self.probe_timeout)
            .await
        {
            Transport::Response(status, _) if status == StatusCode::OK => ProbeOutcome::Ok,
            Transport::Response(_, _) => ProbeOutcome::Rejected,
            Transport::Unreachable(_) => ProbeOutcome::Unreachable,
            Transport::Timeout => ProbeOutcome::Timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_classification() {
        assert!(!ProbeOutcome::Ok.is_unavailable());
        assert!(ProbeOutcome::Unreachable.is_unavailable());
        assert!(ProbeOutcome::Rejected.is_unavailable());
        assert!(ProbeOutcome::Timeout.is_unavailable());
    }

    #[tokio::test]
    async fn test_unreachable_instance() {
        // Nothing listens on this port
        let client = HttpInstanceClient::new(
            1,
            Duration::from_millis(500),
            Duration::from_millis(500),
        );
        let outcome = client.probe_health("127.0.0.1").await;
        assert!(outcome.is_unavailable());
    }
}
