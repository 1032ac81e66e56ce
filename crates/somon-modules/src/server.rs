// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! HTTP management endpoint
//!
//! Serves `GET /health`, `/metrics` (Prometheus text), `/statistics` and
//! `/circuit-breakers`.

use crate::error::{ModuleError, Result};
use crate::health::{HealthReport, HealthStatus};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Data exposed by the endpoint
pub trait ManagementSource: Send + Sync + 'static {
    /// Current health
    fn health(&self) -> HealthReport;
    /// Prometheus exposition text
    fn metrics(&self) -> String;
    /// Statistics document
    fn statistics(&self) -> serde_json::Value;
    /// Circuit breaker states
    fn circuit_breakers(&self) -> serde_json::Value;
}

/// A running management endpoint
#[derive(Debug)]
pub struct ManagementServer {
    addr: SocketAddr,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ManagementServer {
    /// Bind `addr` and start serving
    pub async fn start(addr: SocketAddr, source: Arc<dyn ManagementSource>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ModuleError::Server(format!("cannot bind {}: {}", addr, e)))?;
        let addr = listener.local_addr()?;

        let task = tokio::spawn(async move {
            let mut connections = JoinSet::new();
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Management accept failed");
                        continue;
                    }
                };
                let source = source.clone();
                connections.spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let source = source.clone();
                        async move { Ok::<_, Infallible>(route(source.as_ref(), &req)) }
                    });
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!(%peer, error = %e, "Management connection ended with error");
                    }
                });
                while connections.try_join_next().is_some() {}
            }
        });

        info!(%addr, "Management server listening");
        Ok(Self {
            addr,
            task: Mutex::new(Some(task)),
        })
    }

    /// Address actually bound
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and drop open connections; safe to call repeatedly
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            info!(addr = %self.addr, "Management server stopped");
        }
    }

    /// Whether the server is still running
    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }
}

impl Drop for ManagementServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn route(source: &dyn ManagementSource, req: &Request<Incoming>) -> Response<Full<Bytes>> {
    if req.method() != Method::GET {
        return text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n");
    }
    match req.uri().path() {
        "/health" => {
            let report = source.health();
            let status = if report.status == HealthStatus::Unhealthy {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::OK
            };
            json(status, &report)
        }
        "/metrics" => {
            let body = source.metrics();
            respond(StatusCode::OK, "text/plain; version=0.0.4", body)
        }
        "/statistics" => json(StatusCode::OK, &source.statistics()),
        "/circuit-breakers" => json(StatusCode::OK, &source.circuit_breakers()),
        _ => text(StatusCode::NOT_FOUND, "not found\n"),
    }
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_string_pretty(value) {
        Ok(body) => respond(status, "application/json", body),
        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, &format!("{}\n", e)),
    }
}

fn text(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    respond(status, "text/plain; charset=utf-8", body.to_string())
}

fn respond(status: StatusCode, content_type: &str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if let Ok(value) = header::HeaderValue::from_str(content_type) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    response
}
