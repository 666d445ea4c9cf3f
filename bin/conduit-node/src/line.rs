//! Newline-delimited text protocol used for the node's RPC listener

use async_trait::async_trait;
use conduit_client::{Connection, Transport};
use conduit_core::{Protocol, TransportError};
use conduit_server::ConnectionHandler;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

/// Dials line connections
#[derive(Clone, Copy, Debug, Default)]
pub struct LineTransport;

/// One request line out, one response line back. Calls on the same
/// connection are serialized.
pub struct LineConnection {
    address: String,
    stream: Mutex<BufReader<TcpStream>>,
}

#[async_trait]
impl Transport for LineTransport {
    type Connection = LineConnection;

    fn protocol(&self) -> Protocol {
        Protocol::Rpc
    }

    async fn dial(&self, address: &str, dial_timeout: Duration) -> Result<LineConnection, TransportError> {
        let stream = match timeout(dial_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TransportError::Dial {
                    address: address.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(TransportError::Timeout {
                    target: address.to_string(),
                    timeout_ms: dial_timeout.as_millis() as u64,
                })
            }
        };
        let _ = stream.set_nodelay(true);
        Ok(LineConnection {
            address: address.to_string(),
            stream: Mutex::new(BufReader::new(stream)),
        })
    }
}

#[async_trait]
impl Connection for LineConnection {
    type Request = String;
    type Response = String;

    fn address(&self) -> &str {
        &self.address
    }

    async fn call(&self, request: &String, _timeout: Duration) -> Result<String, TransportError> {
        let mut stream = self.stream.lock().await;
        let disconnected = |_| TransportError::Disconnected(self.address.clone());

        let mut line = request.replace('\n', " ");
        line.push('\n');
        stream.get_mut().write_all(line.as_bytes()).await.map_err(disconnected)?;

        let mut response = String::new();
        let read = stream.read_line(&mut response).await.map_err(disconnected)?;
        if read == 0 {
            return Err(TransportError::Disconnected(self.address.clone()));
        }
        Ok(response.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut stream = self.stream.lock().await;
        stream
            .get_mut()
            .shutdown()
            .await
            .map_err(|e| TransportError::Closed(format!("{}: {}", self.address, e)))
    }
}

/// Echoes every received line
pub struct LineEchoHandler;

#[async_trait]
impl ConnectionHandler for LineEchoHandler {
    async fn handle(&self, stream: TcpStream, peer: SocketAddr) {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let reply = format!("{}\n", line);
                    if let Err(e) = writer.write_all(reply.as_bytes()).await {
                        debug!("Write to {} failed: {}", peer, e);
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("Read from {} failed: {}", peer, e);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_client::CallExecutor;
    use conduit_core::{ClientRegistry, CoreError, ServiceEndpointConfig};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_line_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            LineEchoHandler.handle(stream, peer).await;
        });

        let conn = LineTransport
            .dial(&addr.to_string(), Duration::from_secs(1))
            .await
            .unwrap();
        let first = conn.call(&"hello".to_string(), Duration::from_secs(1)).await.unwrap();
        let second = conn.call(&"again".to_string(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(first, "hello");
        assert_eq!(second, "again");
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let result = LineTransport.dial(&addr.to_string(), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(TransportError::Dial { .. })));
    }

    #[tokio::test]
    async fn test_peer_hangup_is_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let conn = LineTransport
            .dial(&addr.to_string(), Duration::from_secs(1))
            .await
            .unwrap();
        let err = conn.call(&"ping".to_string(), Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_disconnect());
    }

    /// Echo server that holds back its reply to `slow_line` for `delay`
    async fn slow_echo_server(slow_line: &'static str, delay: Duration) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (reader, mut writer) = stream.into_split();
                    let mut lines = BufReader::new(reader).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        if line == slow_line {
                            tokio::time::sleep(delay).await;
                        }
                        if writer.write_all(format!("{}\n", line).as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_timed_out_reply_not_delivered_to_next_call() {
        let addr = slow_echo_server("first", Duration::from_millis(150)).await;
        let mut registry = ClientRegistry::new();
        registry
            .register(
                ServiceEndpointConfig::new_static("echo", Protocol::Rpc, vec![addr.to_string()])
                    .with_retry(1, Duration::from_millis(100), Duration::from_millis(1000)),
            )
            .unwrap();
        let exec = CallExecutor::new(Arc::new(registry), LineTransport);

        let first = exec.execute("echo", "first".to_string()).await;
        assert!(matches!(first, Err(CoreError::AllRetriesExhausted { .. })));
        assert!(exec.cache().is_empty().await);

        // the abandoned reply has arrived by now
        tokio::time::sleep(Duration::from_millis(300)).await;

        let second = exec.execute("echo", "second".to_string()).await.unwrap();
        assert_eq!(second, "second");
    }
}
