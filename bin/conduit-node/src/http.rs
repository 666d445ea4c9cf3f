//! HTTP listener routes of the node

use crate::line::LineTransport;
use conduit_client::ServiceClient;
use conduit_core::CoreError;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderMap;
use hyper::{Method, Request, Response, StatusCode};
use std::sync::Arc;
use tracing::debug;

pub type NodeClient = ServiceClient<LineTransport>;

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

fn error_status(e: &CoreError) -> StatusCode {
    match e {
        CoreError::ServiceNotFound(_) => StatusCode::NOT_FOUND,
        CoreError::ProtocolMismatch { .. } => StatusCode::BAD_REQUEST,
        CoreError::OperationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    }
}

/// Routes:
/// - `GET /healthz`
/// - `/echo` returns the request body
/// - `POST /rpc/<service>` sends the body as one line to `<service>`
/// - `/http/<service>/<path>` forwards method, headers and body to `<service>`
pub async fn handle_request(req: Request<Incoming>, client: Arc<NodeClient>) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(|q| format!("?{}", q)).unwrap_or_default();
    debug!("{} {}", method, path);

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return respond(StatusCode::BAD_REQUEST, format!("{}\n", e)),
    };

    if path == "/healthz" {
        return respond(StatusCode::OK, "OK\n");
    }
    if path == "/echo" {
        return respond(StatusCode::OK, body);
    }

    if let Some(service) = path.strip_prefix("/rpc/") {
        if method != Method::POST {
            return respond(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed\n");
        }
        let line = String::from_utf8_lossy(&body).to_string();
        return match client.call_rpc(service, line).await {
            Ok(reply) => respond(StatusCode::OK, reply),
            Err(e) => respond(error_status(&e), format!("{}\n", e)),
        };
    }

    if let Some(rest) = path.strip_prefix("/http/") {
        let (service, target) = match rest.split_once('/') {
            Some((service, target)) => (service, format!("/{}{}", target, query)),
            None => (rest, format!("/{}", query)),
        };
        let mut headers = HeaderMap::new();
        for (name, value) in parts.headers.iter() {
            if *name != hyper::header::HOST && *name != hyper::header::CONTENT_LENGTH {
                headers.insert(name.clone(), value.clone());
            }
        }
        return match client.call_http(service, method, &target, headers, body).await {
            Ok(reply) => respond(StatusCode::OK, reply),
            Err(e) => respond(error_status(&e), format!("{}\n", e)),
        };
    }

    respond(StatusCode::NOT_FOUND, "Not Found\n")
}
