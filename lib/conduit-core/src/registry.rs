//! Service client registry: logical service name to resolved call settings

use crate::config::{Protocol, RawClientConfig, ServiceEndpointConfig};
use crate::load_balancer::{BalancerHandle, LoadBalancer};
use crate::logging::Logger;
use crate::{CoreError, Result};
use std::collections::HashMap;
use tracing::debug;

/// ClientRegistry maps every configured logical service to its settings and
/// balancer. It is filled once at startup and only read afterwards, so it is
/// shared behind an `Arc` without a lock.
#[derive(Default)]
pub struct ClientRegistry {
    entries: HashMap<String, ClientEntry>,
}

/// Information about a registered client
#[derive(Clone, Debug)]
pub struct ClientEntry {
    pub config: ServiceEndpointConfig,
    pub balancer: BalancerHandle,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `[[client]]` tables. Entries that fail validation are
    /// reported through `logger` and skipped.
    pub fn from_raw(clients: &[RawClientConfig], logger: &dyn Logger) -> Self {
        let mut registry = Self::new();
        for raw in clients {
            let result = raw.validate(logger).and_then(|config| registry.register(config));
            if let Err(e) = result {
                logger.error(&format!(
                    "skipping client entry '{}': {}",
                    raw.service_name, e
                ));
            }
        }
        logger.info(&format!(
            "client registry loaded {} of {} entries",
            registry.len(),
            clients.len()
        ));
        registry
    }

    /// Register or replace a client entry
    pub fn register(&mut self, config: ServiceEndpointConfig) -> Result<()> {
        config.validate()?;
        let balancer = LoadBalancer::register(
            config.service_name.clone(),
            config.static_endpoints.clone(),
            config.balancer,
        );
        debug!(
            "Registered client: {} ({}, {:?}, {} endpoints)",
            config.service_name,
            config.protocol,
            config.resolution,
            config.static_endpoints.len()
        );
        self.entries.insert(
            config.service_name.clone(),
            ClientEntry { config, balancer },
        );
        Ok(())
    }

    /// Get client information
    pub fn get(&self, service_name: &str) -> Result<&ClientEntry> {
        self.entries
            .get(service_name)
            .ok_or_else(|| CoreError::ServiceNotFound(service_name.to_string()))
    }

    /// Look up an entry and check it is configured for `protocol`
    pub fn resolve(&self, service_name: &str, protocol: Protocol) -> Result<&ClientEntry> {
        let entry = self.get(service_name)?;
        if entry.config.protocol != protocol {
            return Err(CoreError::ProtocolMismatch {
                service: service_name.to_string(),
                configured: entry.config.protocol,
                requested: protocol,
            });
        }
        Ok(entry)
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
