//! Discovery directory contract

use crate::address::advertised_address;
use async_trait::async_trait;
use conduit_core::config::{DiscoverySettings, ServerSettings};
use conduit_core::{CoreError, Protocol, Result};
use std::time::Duration;

/// Registration of this process in the discovery directory
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceRegistration {
    /// Unique instance id, `<address>-<port>`
    pub service_id: String,
    /// Id of the TTL health check bound to the instance
    pub check_id: String,
    /// Logical service name other clients look up
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
    /// The directory marks the instance critical when the check is not
    /// renewed within this period
    pub ttl: Duration,
}

impl ServiceRegistration {
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16, ttl: Duration) -> Self {
        let address = address.into();
        let service_id = format!("{}-{}", address, port);
        Self {
            check_id: format!("{}-ttl", service_id),
            service_id,
            name: name.into(),
            address,
            port,
            tags: Vec::new(),
            ttl,
        }
    }

    /// Registration for the listener other services call: the RPC port when
    /// one is configured, the HTTP port otherwise
    pub fn from_settings(server: &ServerSettings, discovery: &DiscoverySettings) -> Result<Self> {
        let port = server
            .port_for(Protocol::Rpc)
            .or_else(|| server.port_for(Protocol::Http))
            .ok_or_else(|| {
                CoreError::RegistrationFailed(format!(
                    "no listener port to register for {}",
                    server.service_name
                ))
            })?;
        let address = advertised_address(server.advertise_address.as_deref())?;
        Ok(Self::new(server.service_name.clone(), address, port, discovery.ttl()))
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Address other instances dial, `host:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// External service directory holding instance registrations and TTL checks
#[async_trait]
pub trait DiscoveryDirectory: Send + Sync {
    /// Register the instance together with its TTL check, initially passing
    async fn register(&self, registration: &ServiceRegistration) -> Result<()>;

    /// Remove the check and the instance
    async fn deregister(&self, service_id: &str, check_id: &str) -> Result<()>;

    /// Mark the TTL check passing
    async fn renew(&self, check_id: &str) -> Result<()>;

    /// Passing instances of `service_name` as `host:port`
    async fn lookup(&self, service_name: &str) -> Result<Vec<String>>;
}
