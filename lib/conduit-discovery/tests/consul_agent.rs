use conduit_core::{CoreError, Resolver};
use conduit_discovery::{
    ConsulDirectory, DiscoveryDirectory, DiscoveryRegistrar, RegistrarState, ServiceRegistration,
};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::tokio::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Clone, Debug)]
struct Recorded {
    method: String,
    path: String,
    body: String,
}

type Log = Arc<Mutex<Vec<Recorded>>>;

const HEALTH_RESPONSE: &str = r#"[
    {"Node": {"Address": "10.0.0.1"}, "Service": {"Address": "10.0.0.11", "Port": 9000}},
    {"Node": {"Address": "10.0.0.2"}, "Service": {"Address": "", "Port": 9000}}
]"#;

/// Minimal Consul agent: records every request, serves health lookups and
/// fails anything mentioning `broken`
async fn spawn_agent() -> (SocketAddr, Log) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let agent_log = log.clone();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let log = agent_log.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let log = log.clone();
                    async move {
                        let method = req.method().to_string();
                        let path = req
                            .uri()
                            .path_and_query()
                            .map(|pq| pq.to_string())
                            .unwrap_or_default();
                        let body = req.into_body().collect().await.unwrap().to_bytes();
                        log.lock().unwrap().push(Recorded {
                            method,
                            path: path.clone(),
                            body: String::from_utf8_lossy(&body).to_string(),
                        });

                        let (status, body) = if path.contains("broken") {
                            (StatusCode::INTERNAL_SERVER_ERROR, "agent error")
                        } else if path.starts_with("/v1/health/service/") {
                            (StatusCode::OK, HEALTH_RESPONSE)
                        } else {
                            (StatusCode::OK, "")
                        };
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(status)
                                .body(Full::new(Bytes::from_static(body.as_bytes())))
                                .unwrap(),
                        )
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, log)
}

fn directory(addr: SocketAddr) -> ConsulDirectory {
    ConsulDirectory::new(format!("http://{}", addr), Duration::from_secs(2)).unwrap()
}

fn registration() -> ServiceRegistration {
    ServiceRegistration::new("echo", "10.0.0.7", 9000, Duration::from_secs(30))
}

#[tokio::test]
async fn test_register_sends_service_with_ttl_check() {
    let (addr, log) = spawn_agent().await;
    directory(addr).register(&registration()).await.unwrap();

    let requests = log.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "PUT");
    assert_eq!(requests[0].path, "/v1/agent/service/register");

    let body: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
    assert_eq!(body["ID"], "10.0.0.7-9000");
    assert_eq!(body["Check"]["CheckID"], "10.0.0.7-9000-ttl");
    assert_eq!(body["Check"]["TTL"], "30s");
}

#[tokio::test]
async fn test_renew_and_deregister_paths() {
    let (addr, log) = spawn_agent().await;
    let dir = directory(addr);
    dir.renew("10.0.0.7-9000-ttl").await.unwrap();
    dir.deregister("10.0.0.7-9000", "10.0.0.7-9000-ttl").await.unwrap();

    let paths: Vec<String> = log.lock().unwrap().iter().map(|r| r.path.clone()).collect();
    assert_eq!(
        paths,
        vec![
            "/v1/agent/check/pass/10.0.0.7-9000-ttl",
            "/v1/agent/check/deregister/10.0.0.7-9000-ttl",
            "/v1/agent/service/deregister/10.0.0.7-9000",
        ]
    );
}

#[tokio::test]
async fn test_lookup_returns_passing_instances() {
    let (addr, log) = spawn_agent().await;
    let dir = directory(addr);
    let endpoints = dir.resolve("echo").await.unwrap();
    assert_eq!(endpoints, vec!["10.0.0.11:9000", "10.0.0.2:9000"]);

    let requests = log.lock().unwrap().clone();
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].path, "/v1/health/service/echo?passing=true");
}

#[tokio::test]
async fn test_agent_errors_are_typed() {
    let (addr, _log) = spawn_agent().await;
    let dir = directory(addr);

    let err = dir.renew("broken-ttl").await.unwrap_err();
    assert!(matches!(err, CoreError::RenewalFailed(_)));

    let err = dir.deregister("broken", "broken-ttl").await.unwrap_err();
    assert!(matches!(err, CoreError::DeregistrationFailed(_)));
}

#[tokio::test]
async fn test_unreachable_agent_leaves_registrar_unregistered() {
    // bind and drop to get a port nobody listens on
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let registrar = DiscoveryRegistrar::new(Arc::new(directory(addr)), Duration::from_secs(10));

    let err = registrar.register(registration()).await.unwrap_err();
    assert!(matches!(err, CoreError::RegistrationFailed(_)));
    assert_eq!(registrar.state(), RegistrarState::Unregistered);
    registrar.deregister().await.unwrap();
}

#[tokio::test]
async fn test_registrar_against_agent() {
    let (addr, log) = spawn_agent().await;
    let registrar = DiscoveryRegistrar::new(Arc::new(directory(addr)), Duration::from_secs(10));

    registrar.register(registration()).await.unwrap();
    registrar.deregister().await.unwrap();
    registrar.deregister().await.unwrap();

    let mutations = log
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.path.contains("deregister"))
        .count();
    // one check removal plus one service removal
    assert_eq!(mutations, 2);
}
