//! HTTP transport over the pooled hyper client

use crate::transport::{Connection, Transport};
use async_trait::async_trait;
use conduit_core::{Protocol, TransportError};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::tokio::TokioExecutor;
use std::time::Duration;
use tracing::debug;

type PooledClient = Client<HttpConnector, Full<Bytes>>;

/// One HTTP request against a logical service
#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: Method,
    /// Path and query, e.g. `/users?id=1`
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }
}

/// Transport for `http` client entries.
///
/// The hyper client keeps its own keep-alive pool per host, so connections
/// are not memoized per service name and every attempt goes through the
/// balancer.
pub struct HttpTransport {
    client: PooledClient,
}

impl HttpTransport {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_keepalive(Some(Duration::from_secs(30)));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .build::<_, Full<Bytes>>(connector);

        Self { client }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    type Connection = HttpConnection;

    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    fn caches_connections(&self) -> bool {
        false
    }

    async fn dial(
        &self,
        address: &str,
        _timeout: Duration,
    ) -> Result<HttpConnection, TransportError> {
        let base_url = base_url(address);
        base_url
            .parse::<Uri>()
            .map_err(|e| TransportError::Dial {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        Ok(HttpConnection {
            base_url,
            client: self.client.clone(),
        })
    }
}

/// Handle on one endpoint; sockets are checked out of the shared pool per
/// request
pub struct HttpConnection {
    base_url: String,
    client: PooledClient,
}

impl HttpConnection {
    fn build(&self, request: &HttpRequest) -> Result<Request<Full<Bytes>>, TransportError> {
        let uri = join_url(&self.base_url, &request.path);
        let mut builder = Request::builder().method(request.method.clone()).uri(&uri);
        if let Some(headers) = builder.headers_mut() {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            for (name, value) in request.headers.iter() {
                headers.insert(name.clone(), value.clone());
            }
        }
        builder
            .body(Full::new(request.body.clone()))
            .map_err(|e| TransportError::Call {
                address: uri,
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl Connection for HttpConnection {
    type Request = HttpRequest;
    type Response = Bytes;

    fn address(&self) -> &str {
        &self.base_url
    }

    async fn call(&self, request: &HttpRequest, _timeout: Duration) -> Result<Bytes, TransportError> {
        let outgoing = self.build(request)?;
        debug!("{} {}{}", request.method, self.base_url, request.path);

        let response = self.client.request(outgoing).await.map_err(|e| {
            if e.is_connect() {
                TransportError::Dial {
                    address: self.base_url.clone(),
                    reason: e.to_string(),
                }
            } else {
                TransportError::Call {
                    address: self.base_url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| TransportError::Call {
                address: self.base_url.clone(),
                reason: e.to_string(),
            })?
            .to_bytes();

        if status.is_client_error() || status.is_server_error() {
            return Err(TransportError::Status {
                address: self.base_url.clone(),
                status: status.as_u16(),
            });
        }
        Ok(body)
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Endpoints are configured as `host:port`; a scheme is added when missing
fn base_url(address: &str) -> String {
    let address = address.trim().trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

fn join_url(base_url: &str, path: &str) -> String {
    if path.is_empty() {
        format!("{}/", base_url)
    } else if path.starts_with('/') {
        format!("{}{}", base_url, path)
    } else {
        format!("{}/{}", base_url, path)
    }
}
