use async_trait::async_trait;
use conduit_client::{Connection, ServiceClient, Transport};
use conduit_core::{
    BalancerStrategy, ClientRegistry, CoreError, Protocol, ResourcePool, ServiceEndpointConfig,
    TransportError,
};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::HeaderMap;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::tokio::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// RPC side is unused here
struct NoRpc;

struct NoRpcConnection;

#[async_trait]
impl Transport for NoRpc {
    type Connection = NoRpcConnection;

    fn protocol(&self) -> Protocol {
        Protocol::Rpc
    }

    async fn dial(&self, address: &str, _timeout: Duration) -> Result<NoRpcConnection, TransportError> {
        Err(TransportError::Dial {
            address: address.to_string(),
            reason: "rpc disabled".to_string(),
        })
    }
}

#[async_trait]
impl Connection for NoRpcConnection {
    type Request = ();
    type Response = ();

    fn address(&self) -> &str {
        ""
    }

    async fn call(&self, _request: &(), _timeout: Duration) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Serve `body` with `status` for every request, returning the bound address
async fn spawn_backend(status: StatusCode, body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let service = service_fn(move |_req: Request<hyper::body::Incoming>| async move {
                    Ok::<_, Infallible>(
                        Response::builder()
                            .status(status)
                            .body(Full::new(Bytes::from_static(body.as_bytes())))
                            .unwrap(),
                    )
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

fn client(config: ServiceEndpointConfig) -> ServiceClient<NoRpc> {
    let mut registry = ClientRegistry::new();
    registry.register(config).unwrap();
    ServiceClient::new(Arc::new(registry), NoRpc)
}

#[tokio::test]
async fn test_round_robin_http_calls_alternate_backends() {
    let a = spawn_backend(StatusCode::OK, "a").await;
    let b = spawn_backend(StatusCode::OK, "b").await;
    let client = client(
        ServiceEndpointConfig::new_static("web", Protocol::Http, vec![a.to_string(), b.to_string()])
            .with_balancer(BalancerStrategy::RoundRobin),
    );

    let mut bodies = Vec::new();
    for _ in 0..4 {
        let body = client.get("web", "/hello").await.unwrap();
        bodies.push(String::from_utf8(body.to_vec()).unwrap());
    }
    assert_eq!(bodies, vec!["a", "b", "a", "b"]);
}

#[tokio::test]
async fn test_call_http_with_headers_and_body() {
    let addr = spawn_backend(StatusCode::OK, "created").await;
    let client = client(ServiceEndpointConfig::new_static(
        "web",
        Protocol::Http,
        vec![addr.to_string()],
    ));

    let body = client
        .call_http(
            "web",
            Method::PUT,
            "/items/1",
            HeaderMap::new(),
            Bytes::from_static(b"{\"name\":\"x\"}"),
        )
        .await
        .unwrap();
    assert_eq!(body, Bytes::from_static(b"created"));
}

#[tokio::test]
async fn test_error_status_exhausts_retries() {
    let addr = spawn_backend(StatusCode::INTERNAL_SERVER_ERROR, "boom").await;
    let client = client(
        ServiceEndpointConfig::new_static("web", Protocol::Http, vec![addr.to_string()]).with_retry(
            2,
            Duration::from_millis(500),
            Duration::from_secs(2),
        ),
    );

    let err = client.post("web", "/jobs", "{}").await.unwrap_err();
    match err {
        CoreError::AllRetriesExhausted {
            attempts, source, ..
        } => {
            assert_eq!(attempts, 2);
            assert!(matches!(source, TransportError::Status { status: 500, .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_http_entry_is_not_callable_over_rpc() {
    let client = client(ServiceEndpointConfig::new_static(
        "web",
        Protocol::Http,
        vec!["127.0.0.1:1".to_string()],
    ));
    let err = client.call_rpc("web", ()).await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::ProtocolMismatch {
            configured: Protocol::Http,
            requested: Protocol::Rpc,
            ..
        }
    ));
}

#[tokio::test]
async fn test_only_caching_transports_expose_caches() {
    let client = client(ServiceEndpointConfig::new_static(
        "web",
        Protocol::Http,
        vec!["127.0.0.1:80".to_string()],
    ));
    let names: Vec<String> = client
        .connection_caches()
        .iter()
        .map(|cache| cache.name().to_string())
        .collect();
    assert_eq!(names, vec!["rpc-connections"]);
}
