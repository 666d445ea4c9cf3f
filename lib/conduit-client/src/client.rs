//! Client entry points used by application code

use crate::executor::CallExecutor;
use crate::http::{HttpRequest, HttpTransport};
use crate::metrics::MetricsCollector;
use crate::transport::{RequestOf, ResponseOf, Transport};
use conduit_core::{ClientRegistry, ResourcePool, Resolver, Result};
use hyper::body::Bytes;
use hyper::header::HeaderMap;
use hyper::Method;
use std::sync::Arc;

/// ServiceClient routes calls by logical service name, RPC calls through the
/// application's transport `R` and HTTP calls through [`HttpTransport`].
pub struct ServiceClient<R: Transport> {
    registry: Arc<ClientRegistry>,
    rpc: CallExecutor<R>,
    http: CallExecutor<HttpTransport>,
}

impl<R: Transport> ServiceClient<R> {
    pub fn new(registry: Arc<ClientRegistry>, rpc_transport: R) -> Self {
        Self {
            rpc: CallExecutor::new(registry.clone(), rpc_transport),
            http: CallExecutor::new(registry.clone(), HttpTransport::new()),
            registry,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.rpc = self.rpc.with_resolver(resolver.clone());
        self.http = self.http.with_resolver(resolver);
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.rpc = self.rpc.with_metrics(metrics.clone());
        self.http = self.http.with_metrics(metrics);
        self
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub async fn call_rpc(&self, service_name: &str, request: RequestOf<R>) -> Result<ResponseOf<R>> {
        self.rpc.execute(service_name, request).await
    }

    pub async fn call_http(
        &self,
        service_name: &str,
        method: Method,
        path: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<Bytes> {
        let request = HttpRequest::new(method, path)
            .with_headers(headers)
            .with_body(body);
        self.http.execute(service_name, request).await
    }

    pub async fn get(&self, service_name: &str, path: &str) -> Result<Bytes> {
        self.http.execute(service_name, HttpRequest::get(path)).await
    }

    pub async fn post(&self, service_name: &str, path: &str, body: impl Into<Bytes>) -> Result<Bytes> {
        self.http
            .execute(service_name, HttpRequest::post(path, body))
            .await
    }

    /// Caches to close during shutdown. Transports that pool their own
    /// sockets never fill theirs, so those are left out.
    pub fn connection_caches(&self) -> Vec<Arc<dyn ResourcePool>> {
        let mut caches = Vec::new();
        if self.rpc.transport().caches_connections() {
            caches.push(self.rpc.cache().clone() as Arc<dyn ResourcePool>);
        }
        if self.http.transport().caches_connections() {
            caches.push(self.http.cache().clone() as Arc<dyn ResourcePool>);
        }
        caches
    }
}
