// src/orchestrator/server.rs
//! Orchestrator HTTP API
//!
//! Routes:
//! - `GET /simulations` — fleet + simulation snapshot
//! - `POST /simulations` — create
//! - `POST /simulations/{id}` — restart from backup
//! - `DELETE /simulations/{id}` — delete
//! - `PUT /instances/{id}/state` — self-report sink

use crate::api::{CreateSimulationData, CreatedSimulation, ErrorBody};
use crate::orchestrator::fleet::FleetService;
use crate::registry::record::InstanceRecord;
use crate::utils::errors::{FleetError, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// HTTP front of the [`FleetService`]
pub struct OrchestratorServer {
    service: Arc<FleetService>,
    listener: TcpListener,
}

impl OrchestratorServer {
    /// Bind the listening socket
    pub async fn bind(service: Arc<FleetService>, addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { service, listener })
    }

    /// The bound address (useful when binding port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever
    pub async fn serve(self) -> Result<()> {
        info!(
            "Orchestrator API listening on {}",
            self.listener.local_addr()?
        );

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let service = Arc::clone(&self.service);

                    tokio::spawn(async move {
                        debug!("Accepted connection from {}", addr);

                        let io = TokioIo::new(stream);
                        let handler = service_fn(move |req| {
                            let service = Arc::clone(&service);
                            async move { Ok::<_, hyper::Error>(route(service, req).await) }
                        });

                        if let Err(e) = http1::Builder::new().serve_connection(io, handler).await {
                            error!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

async fn route(service: Arc<FleetService>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, &format!("Body read error: {}", e))
        }
    };

    match segments.as_slice() {
        ["simulations"] if method == Method::GET => match service.snapshot().await {
            Ok(snapshot) => json_response(StatusCode::OK, &snapshot),
            Err(err) => fleet_error_response(&err),
        },

        ["simulations"] if method == Method::POST => {
            let data: CreateSimulationData = match serde_json::from_slice(&body) {
                Ok(data) => data,
                Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
            };
            match service.create_simulation(data).await {
                Ok(simulation_id) => {
                    json_response(StatusCode::CREATED, &CreatedSimulation { simulation_id })
                }
                Err(err) => fleet_error_response(&err),
            }
        }

        ["simulations", id] if method == Method::POST => {
            match service.restart_simulation(id).await {
                Ok(simulation_id) => {
                    json_response(StatusCode::CREATED, &CreatedSimulation { simulation_id })
                }
                Err(err) => fleet_error_response(&err),
            }
        }

        ["simulations", id] if method == Method::DELETE => {
            match service.delete_simulation(id).await {
                Ok(()) => json_response(StatusCode::OK, &serde_json::json!({"status": "deleted"})),
                Err(err) => fleet_error_response(&err),
            }
        }

        ["instances", id, "state"] if method == Method::PUT => {
            let mut record: InstanceRecord = match serde_json::from_slice(&body) {
                Ok(record) => record,
                Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
            };
            // The path segment is authoritative for the identity
            record.key = id.to_string();
            match service.handle_instance_report(record).await {
                Ok(()) => json_response(StatusCode::OK, &serde_json::json!({"status": "ok"})),
                Err(err) => fleet_error_response(&err),
            }
        }

        _ => error_response(StatusCode::NOT_FOUND, "no such route"),
    }
}

/// HTTP status for a service-layer error
pub fn http_status(err: &FleetError) -> StatusCode {
    match err {
        FleetError::SimulationException(_) => StatusCode::CONFLICT,
        FleetError::SimulationNotFound(_) => StatusCode::NOT_FOUND,
        FleetError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
        FleetError::BackupPersistenceFailed(_) => StatusCode::BAD_GATEWAY,
        FleetError::RegistryUnavailable(_)
        | FleetError::NoIdleInstances
        | FleetError::CreationExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        FleetError::DeletionIncomplete { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn fleet_error_response(err: &FleetError) -> Response<Full<Bytes>> {
    error_response(http_status(err), &err.to_string())
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .unwrap(),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("Encode error: {}", e),
        ),
    }
}

fn error_response(status: StatusCode, detail: &str) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(&ErrorBody {
        detail: detail.to_string(),
    })
    .unwrap_or_default();

    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}
