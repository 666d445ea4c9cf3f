//! Per-connection handlers the accept loops dispatch to

use async_trait::async_trait;
use futures::future::BoxFuture;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::tokio::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::debug;

/// Serves one accepted connection until it closes
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn handle(&self, stream: TcpStream, peer: SocketAddr);
}

type RequestFn =
    dyn Fn(Request<Incoming>) -> BoxFuture<'static, Response<Full<Bytes>>> + Send + Sync;

/// Serves HTTP/1.1 on the connection, answering every request with `F`
#[derive(Clone)]
pub struct HttpHandler {
    handler: Arc<RequestFn>,
}

impl HttpHandler {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |req| -> BoxFuture<'static, Response<Full<Bytes>>> {
                Box::pin(handler(req))
            }),
        }
    }
}

#[async_trait]
impl ConnectionHandler for HttpHandler {
    async fn handle(&self, stream: TcpStream, peer: SocketAddr) {
        let io = TokioIo::new(stream);
        let handler = self.handler.clone();
        let service = service_fn(move |req| {
            let handler = handler.clone();
            async move { Ok::<_, Infallible>(handler(req).await) }
        });

        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
            debug!("Error serving HTTP connection from {}: {}", peer, e);
        }
    }
}
