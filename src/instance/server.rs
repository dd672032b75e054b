// src/instance/server.rs
//! Instance HTTP API
//!
//! Routes:
//! - `GET /healthcheck` — current status
//! - `POST /simulation` — start a shard (201 on accept)
//! - `DELETE /simulation` — stop, returns the simulation id that ran

use crate::api::{CreateShardData, CreatedSimulation, DeletedShard, ErrorBody, Healthcheck};
use crate::instance::state::InstanceState;
use crate::orchestrator::server::http_status;
use crate::utils::errors::Result;
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

/// HTTP front of the [`InstanceState`] machine
pub struct InstanceServer {
    state: Arc<InstanceState>,
    listener: TcpListener,
}

impl InstanceServer {
    pub async fn bind(state: Arc<InstanceState>, addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { state, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self) -> Result<()> {
        info!("Instance API listening on {}", self.listener.local_addr()?);

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let state = Arc::clone(&self.state);

                    tokio::spawn(async move {
                        debug!("Accepted connection from {}", addr);

                        let io = TokioIo::new(stream);
                        let handler = service_fn(move |req| {
                            let state = Arc::clone(&state);
                            async move { Ok::<_, hyper::Error>(route(state, req).await) }
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

async fn route(state: Arc<InstanceState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
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
        ["healthcheck"] if method == Method::GET => {
            let status = state.status().await;
            json_response(StatusCode::OK, &Healthcheck { status })
        }

        ["simulation"] if method == Method::POST => {
            let data: CreateShardData = match serde_json::from_slice(&body) {
                Ok(data) => data,
                Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
            };
            let simulation_id = data.simulation_id.clone();
            match state
                .start(data.simulation_id, data.agent_code_lines, data.agent_data)
                .await
            {
                Ok(()) => json_response(StatusCode::CREATED, &CreatedSimulation { simulation_id }),
                Err(err) => error_response(http_status(&err), &err.to_string()),
            }
        }

        ["simulation"] if method == Method::DELETE => match state.kill().await {
            Ok(simulation_id) => json_response(StatusCode::OK, &DeletedShard { simulation_id }),
            Err(err) => error_response(http_status(&err), &err.to_string()),
        },

        _ => error_response(StatusCode::NOT_FOUND, "no such route"),
    }
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
