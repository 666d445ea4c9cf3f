//! Transport seam shared by the RPC and HTTP call paths
//!
//! The executor only needs to dial an address and issue a request over the
//! resulting connection; framing and encoding belong to the transport.

use async_trait::async_trait;
use conduit_core::{Protocol, TransportError};
use std::time::Duration;

/// Established channel to one resolved target
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    type Request: Send + Sync + 'static;
    type Response: Send + 'static;

    /// Address this connection was dialed to
    fn address(&self) -> &str;

    /// Issue one request. `timeout` is the budget of the current attempt.
    async fn call(
        &self,
        request: &Self::Request,
        timeout: Duration,
    ) -> Result<Self::Response, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Dials connections for one protocol
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: Connection;

    fn protocol(&self) -> Protocol;

    /// Whether dialed connections are memoized per service name. Transports
    /// that pool sockets internally return `false` so every attempt goes
    /// through the balancer again.
    fn caches_connections(&self) -> bool {
        true
    }

    async fn dial(&self, address: &str, timeout: Duration)
        -> Result<Self::Connection, TransportError>;
}

pub type RequestOf<T> = <<T as Transport>::Connection as Connection>::Request;
pub type ResponseOf<T> = <<T as Transport>::Connection as Connection>::Response;
