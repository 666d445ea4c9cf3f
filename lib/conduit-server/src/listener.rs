//! Protocol listeners and their accept loops

use crate::handler::ConnectionHandler;
use crate::limiter::Limiter;
use conduit_client::MetricsCollector;
use conduit_core::{CoreError, Protocol};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerState {
    /// No port configured; skipped without error
    NotRequested,
    Bound,
    Failed,
    Serving,
    Stopped,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One protocol listener
pub struct ListenerHandle {
    pub protocol: Protocol,
    /// `host:port` as configured, `None` when not requested
    pub requested_address: Option<String>,
    pub bound_address: Option<SocketAddr>,
    pub state: ListenerState,
    failure: Option<String>,
    socket: Option<TcpListener>,
}

impl ListenerHandle {
    /// Bind `host:port` for `protocol`. Port `None` (or 0) is not requested.
    pub async fn bind(protocol: Protocol, host: &str, port: Option<u16>) -> Self {
        let port = match port {
            Some(port) if port != 0 => port,
            _ => {
                debug!("{} listener not requested", protocol);
                return Self {
                    protocol,
                    requested_address: None,
                    bound_address: None,
                    state: ListenerState::NotRequested,
                    failure: None,
                    socket: None,
                };
            }
        };

        let address = format!("{}:{}", host, port);
        let (state, bound_address, failure, socket) = match TcpListener::bind(&address).await {
            Ok(socket) => {
                let bound = socket.local_addr().ok();
                info!("{} listener bound on {}", protocol, address);
                (ListenerState::Bound, bound, None, Some(socket))
            }
            Err(e) => {
                warn!("{} listener failed to bind {}: {}", protocol, address, e);
                (ListenerState::Failed, None, Some(e.to_string()), None)
            }
        };

        Self {
            protocol,
            requested_address: Some(address),
            bound_address,
            state,
            failure,
            socket,
        }
    }

    pub fn is_requested(&self) -> bool {
        self.state != ListenerState::NotRequested
    }

    /// The bind failure, if this listener failed
    pub fn error(&self) -> Option<CoreError> {
        let reason = self.failure.as_ref()?;
        Some(CoreError::ListenerBindFailed {
            protocol: self.protocol,
            address: self.requested_address.clone().unwrap_or_default(),
            reason: reason.clone(),
        })
    }

    /// Hand the socket to an accept loop; only once, only when bound
    pub(crate) fn take_socket(&mut self) -> Option<TcpListener> {
        if self.state != ListenerState::Bound {
            return None;
        }
        let socket = self.socket.take()?;
        self.state = ListenerState::Serving;
        Some(socket)
    }

    pub(crate) fn mark_stopped(&mut self) {
        if self.state == ListenerState::Serving || self.state == ListenerState::Bound {
            self.state = ListenerState::Stopped;
            self.socket = None;
        }
    }
}

/// Merge bind failures into one error naming every failed listener
pub fn aggregate_bind_errors(mut errors: Vec<CoreError>) -> Option<CoreError> {
    if errors.len() <= 1 {
        return errors.pop();
    }
    let reason = errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ");
    match errors.swap_remove(0) {
        CoreError::ListenerBindFailed {
            protocol, address, ..
        } => Some(CoreError::ListenerBindFailed {
            protocol,
            address,
            reason,
        }),
        other => Some(other),
    }
}

/// Accept until `stop` flips to true. Every admitted connection is served on
/// its own task; connections already being served are not interrupted.
pub async fn accept_loop(
    listener: TcpListener,
    protocol: Protocol,
    handler: Arc<dyn ConnectionHandler>,
    limiter: Arc<dyn Limiter>,
    metrics: Option<MetricsCollector>,
    mut stop: watch::Receiver<bool>,
) {
    let protocol_label = protocol.to_string();
    let mut rejected: u64 = 0;

    loop {
        let accepted = tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
                continue;
            }
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Error accepting {} connection: {}", protocol, e);
                continue;
            }
        };

        if !limiter.allow() {
            rejected += 1;
            warn!(
                "Rate limit rejected {} connection from {} ({} rejected so far)",
                protocol, peer, rejected
            );
            if let Some(metrics) = &metrics {
                metrics
                    .connections_rejected_total
                    .with_label_values(&[&protocol_label])
                    .inc();
            }
            drop(stream);
            continue;
        }

        if let Some(metrics) = &metrics {
            metrics
                .connections_accepted_total
                .with_label_values(&[&protocol_label])
                .inc();
        }

        let handler = handler.clone();
        tokio::spawn(async move {
            handler.handle(stream, peer).await;
        });
    }

    info!("{} listener stopped accepting", protocol);
}
