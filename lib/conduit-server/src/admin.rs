//! Metrics and profiling endpoints, each on its own port

use anyhow::Result;
use conduit_client::MetricsCollector;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::tokio::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Which admin surface a port exposes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdminEndpoint {
    /// `GET /metrics`
    Metrics,
    /// `GET /debug/vars`
    Profiling,
}

/// Shared state of the admin endpoints
pub struct AdminState {
    pub service_name: String,
    pub metrics: Option<MetricsCollector>,
    started: Instant,
}

#[derive(Serialize)]
struct DebugVars<'a> {
    service: &'a str,
    pid: u32,
    uptime_secs: u64,
    runtime_workers: usize,
    version: &'static str,
}

impl AdminState {
    pub fn new(service_name: impl Into<String>, metrics: Option<MetricsCollector>) -> Self {
        Self {
            service_name: service_name.into(),
            metrics,
            started: Instant::now(),
        }
    }

    fn debug_vars(&self) -> Result<String> {
        let runtime_workers = tokio::runtime::Handle::try_current()
            .map(|handle| handle.metrics().num_workers())
            .unwrap_or(0);
        let vars = DebugVars {
            service: &self.service_name,
            pid: std::process::id(),
            uptime_secs: self.started.elapsed().as_secs(),
            runtime_workers,
            version: env!("CARGO_PKG_VERSION"),
        };
        Ok(serde_json::to_string(&vars)?)
    }
}

fn text_response(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

/// Route one admin request
pub fn route(endpoint: AdminEndpoint, state: &AdminState, method: &Method, path: &str) -> Response<Full<Bytes>> {
    if *method != Method::GET {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "text/plain", "Method Not Allowed\n");
    }

    match (endpoint, path) {
        (_, "/healthz") => text_response(StatusCode::OK, "text/plain", "OK\n"),
        (AdminEndpoint::Metrics, "/metrics") => match &state.metrics {
            Some(metrics) => match metrics.gather() {
                Ok(text) => text_response(StatusCode::OK, "text/plain; version=0.0.4", text),
                Err(e) => {
                    warn!("Failed to gather metrics: {}", e);
                    text_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "text/plain",
                        "Failed to gather metrics\n",
                    )
                }
            },
            None => text_response(StatusCode::NOT_FOUND, "text/plain", "Metrics disabled\n"),
        },
        (AdminEndpoint::Profiling, "/debug/vars") => match state.debug_vars() {
            Ok(json) => text_response(StatusCode::OK, "application/json", json),
            Err(e) => text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                format!("{}\n", e),
            ),
        },
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found\n"),
    }
}

/// Serve `endpoint` on `port` until the task is aborted
pub async fn serve(endpoint: AdminEndpoint, host: String, port: u16, state: Arc<AdminState>) -> Result<()> {
    let address = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&address).await?;
    info!("{:?} endpoint listening on {}", endpoint, address);

    loop {
        let (stream, peer) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move {
                    Ok::<_, Infallible>(route(endpoint, &state, req.method(), req.uri().path()))
                }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("Error serving admin connection from {}: {}", peer, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let metrics = MetricsCollector::new().unwrap();
        metrics.record_attempt("users", true);
        let state = AdminState::new("echo", Some(metrics));

        let response = route(AdminEndpoint::Metrics, &state, &Method::GET, "/metrics");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body(response).await.contains("conduit_call_attempts_total"));

        let response = route(AdminEndpoint::Metrics, &state, &Method::GET, "/debug/vars");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_debug_vars_endpoint() {
        let state = AdminState::new("echo", None);
        let response = route(AdminEndpoint::Profiling, &state, &Method::GET, "/debug/vars");
        assert_eq!(response.status(), StatusCode::OK);

        let vars: serde_json::Value = serde_json::from_str(&body(response).await).unwrap();
        assert_eq!(vars["service"], "echo");
        assert_eq!(vars["pid"], std::process::id());
    }

    #[tokio::test]
    async fn test_healthz_and_methods() {
        let state = AdminState::new("echo", None);
        let response = route(AdminEndpoint::Profiling, &state, &Method::GET, "/healthz");
        assert_eq!(body(response).await, "OK\n");

        let response = route(AdminEndpoint::Metrics, &state, &Method::POST, "/metrics");
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let response = route(AdminEndpoint::Metrics, &state, &Method::GET, "/metrics");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
