//! Per-service connection cache

use crate::transport::Connection;
use async_trait::async_trait;
use conduit_core::{ResourcePool, Result as CoreResult, TransportError};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Keeps at most one live connection per service name.
///
/// Dialing happens outside the lock, so two callers racing on a cold entry
/// may both dial. Only the first insert is kept; the loser closes its
/// connection and returns the cached one.
pub struct ConnectionCache<C: Connection> {
    name: String,
    connections: RwLock<HashMap<String, Arc<C>>>,
}

impl<C: Connection> ConnectionCache<C> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, service_name: &str) -> Option<Arc<C>> {
        self.connections.read().await.get(service_name).cloned()
    }

    /// Return the cached connection for `service_name`, dialing with `dial`
    /// when there is none
    pub async fn get_or_create<F, Fut>(
        &self,
        service_name: &str,
        dial: F,
    ) -> Result<Arc<C>, TransportError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, TransportError>>,
    {
        if let Some(conn) = self.get(service_name).await {
            return Ok(conn);
        }

        let dialed = Arc::new(dial().await?);

        let existing = {
            let mut connections = self.connections.write().await;
            match connections.get(service_name) {
                Some(existing) => existing.clone(),
                None => {
                    connections.insert(service_name.to_string(), dialed.clone());
                    debug!("Cached connection for {} -> {}", service_name, dialed.address());
                    return Ok(dialed);
                }
            }
        };

        debug!(
            "Discarding duplicate connection for {} -> {}",
            service_name,
            dialed.address()
        );
        if let Err(e) = dialed.close().await {
            warn!("Failed to close duplicate connection for {}: {}", service_name, e);
        }
        Ok(existing)
    }

    /// Drop `conn` from the cache if it is still the cached entry, and close it
    pub async fn evict(&self, service_name: &str, conn: &Arc<C>) -> bool {
        let removed = {
            let mut connections = self.connections.write().await;
            match connections.get(service_name) {
                Some(cached) if Arc::ptr_eq(cached, conn) => connections.remove(service_name),
                _ => None,
            }
        };

        match removed {
            Some(conn) => {
                debug!("Evicted connection for {} -> {}", service_name, conn.address());
                if let Err(e) = conn.close().await {
                    warn!("Failed to close evicted connection for {}: {}", service_name, e);
                }
                true
            }
            None => false,
        }
    }

    /// Eviction for callers that cannot await, such as drop guards. The entry
    /// is removed before returning when the lock is free; otherwise removal
    /// and closing both run on a spawned task.
    pub fn evict_detached(self: &Arc<Self>, service_name: &str, conn: Arc<C>) {
        let removed = match self.connections.try_write() {
            Ok(mut connections) => match connections.get(service_name) {
                Some(cached) if Arc::ptr_eq(cached, &conn) => connections.remove(service_name),
                _ => None,
            },
            Err(_) => {
                let cache = self.clone();
                let service_name = service_name.to_string();
                spawn_detached(async move {
                    cache.evict(&service_name, &conn).await;
                });
                return;
            }
        };

        if let Some(conn) = removed {
            debug!("Evicted abandoned connection for {} -> {}", service_name, conn.address());
            let service_name = service_name.to_string();
            spawn_detached(async move {
                if let Err(e) = conn.close().await {
                    warn!("Failed to close evicted connection for {}: {}", service_name, e);
                }
            });
        }
    }

    /// Close every cached connection. Individual failures are logged and
    /// skipped; returns how many connections were closed cleanly.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<(String, Arc<C>)> = self.connections.write().await.drain().collect();
        let mut closed = 0;
        for (service_name, conn) in drained {
            match conn.close().await {
                Ok(()) => closed += 1,
                Err(e) => warn!(
                    "Failed to close connection for {} -> {}: {}",
                    service_name,
                    conn.address(),
                    e
                ),
            }
        }
        debug!("Connection cache {} closed {} connections", self.name, closed);
        closed
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

fn spawn_detached<F>(task: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(task);
        }
        Err(_) => warn!("No runtime available, dropping connection cleanup"),
    }
}

#[async_trait]
impl<C: Connection> ResourcePool for ConnectionCache<C> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn close(&self) -> CoreResult<()> {
        self.close_all().await;
        Ok(())
    }
}
