//! Call executor: endpoint selection, bounded retries and the overall deadline

use crate::cache::ConnectionCache;
use crate::metrics::{CallOutcome, MetricsCollector};
use crate::policy::CallPolicy;
use crate::transport::{Connection, RequestOf, ResponseOf, Transport};
use conduit_core::{
    ClientEntry, ClientRegistry, CoreError, ResolutionMode, Resolver, Result, TransportError,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Runs logical calls for every registry entry of one protocol.
///
/// Attempts of a single call are strictly sequential; independent calls run
/// concurrently and share the connection cache.
pub struct CallExecutor<T: Transport> {
    registry: Arc<ClientRegistry>,
    transport: Arc<T>,
    cache: Arc<ConnectionCache<T::Connection>>,
    resolver: Option<Arc<dyn Resolver>>,
    metrics: Option<MetricsCollector>,
}

impl<T: Transport> CallExecutor<T> {
    pub fn new(registry: Arc<ClientRegistry>, transport: T) -> Self {
        let cache_name = format!("{}-connections", transport.protocol());
        Self {
            registry,
            transport: Arc::new(transport),
            cache: Arc::new(ConnectionCache::new(cache_name)),
            resolver: None,
            metrics: None,
        }
    }

    /// Resolver used by entries in discovery mode
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn cache(&self) -> &Arc<ConnectionCache<T::Connection>> {
        &self.cache
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Execute one logical call against `service_name`.
    ///
    /// The whole retry loop runs under the entry's overall timeout. When it
    /// elapses the in-flight attempt is dropped and its result, if any, is
    /// never observed.
    pub async fn execute(
        &self,
        service_name: &str,
        request: RequestOf<T>,
    ) -> Result<ResponseOf<T>> {
        let protocol = self.transport.protocol();
        let entry = self.registry.resolve(service_name, protocol)?;
        let policy = CallPolicy::from_config(&entry.config);
        let started = Instant::now();

        let result = match timeout(
            policy.overall_timeout,
            self.attempt_loop(entry, &policy, &request),
        )
        .await
        {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(last_error)) => {
                warn!(
                    "Call to {} failed after {} attempts: {}",
                    service_name, policy.attempts, last_error
                );
                Err(CoreError::AllRetriesExhausted {
                    service: service_name.to_string(),
                    attempts: policy.attempts,
                    timeout_ms: policy.overall_timeout_ms(),
                    source: last_error,
                })
            }
            Err(_) => {
                warn!(
                    "Call to {} timed out after {} ms",
                    service_name,
                    policy.overall_timeout_ms()
                );
                Err(CoreError::OperationTimeout {
                    service: service_name.to_string(),
                    timeout_ms: policy.overall_timeout_ms(),
                    attempts: policy.attempts,
                })
            }
        };

        if let Some(metrics) = &self.metrics {
            let outcome = match &result {
                Ok(_) => CallOutcome::Ok,
                Err(CoreError::OperationTimeout { .. }) => CallOutcome::Timeout,
                Err(_) => CallOutcome::Exhausted,
            };
            metrics.record_call(service_name, &protocol.to_string(), outcome, started.elapsed());
        }

        result
    }

    async fn attempt_loop(
        &self,
        entry: &ClientEntry,
        policy: &CallPolicy,
        request: &RequestOf<T>,
    ) -> std::result::Result<ResponseOf<T>, TransportError> {
        let service_name = entry.config.service_name.as_str();
        let attempt_timeout = policy.effective_attempt_timeout();
        let deadline = tokio::time::Instant::now() + policy.overall_timeout;
        let mut last_error = None;

        for attempt in 1..=policy.attempts {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let outcome = match policy.attempt_budget(remaining) {
                Some(budget) => match timeout(budget, self.attempt(entry, request, budget)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(TransportError::Timeout {
                        target: service_name.to_string(),
                        timeout_ms: budget.as_millis() as u64,
                    }),
                },
                None => self.attempt(entry, request, attempt_timeout).await,
            };

            if let Some(metrics) = &self.metrics {
                metrics.record_attempt(service_name, outcome.is_ok());
            }

            match outcome {
                Ok(response) => {
                    debug!("Call to {} succeeded on attempt {}", service_name, attempt);
                    return Ok(response);
                }
                Err(e) => {
                    debug!(
                        "Attempt {}/{} to {} failed: {}",
                        attempt, policy.attempts, service_name, e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| TransportError::Call {
            address: service_name.to_string(),
            reason: "no attempt was made".to_string(),
        }))
    }

    async fn attempt(
        &self,
        entry: &ClientEntry,
        request: &RequestOf<T>,
        attempt_timeout: Duration,
    ) -> std::result::Result<ResponseOf<T>, TransportError> {
        let service_name = entry.config.service_name.as_str();
        let conn = self.connection(entry, attempt_timeout).await?;
        let checkout = self
            .transport
            .caches_connections()
            .then(|| Checkout::new(&self.cache, service_name, conn.clone()));

        let result = conn.call(request, attempt_timeout).await;
        if let Some(checkout) = checkout {
            checkout.release();
        }

        match result {
            Ok(response) => Ok(response),
            Err(e) => {
                if e.leaves_connection_unusable() && self.transport.caches_connections() {
                    self.cache.evict(service_name, &conn).await;
                }
                Err(e)
            }
        }
    }

    async fn connection(
        &self,
        entry: &ClientEntry,
        attempt_timeout: Duration,
    ) -> std::result::Result<Arc<T::Connection>, TransportError> {
        if !self.transport.caches_connections() {
            return self.dial(entry, attempt_timeout).await.map(Arc::new);
        }
        self.cache
            .get_or_create(&entry.config.service_name, || {
                self.dial(entry, attempt_timeout)
            })
            .await
    }

    async fn dial(
        &self,
        entry: &ClientEntry,
        attempt_timeout: Duration,
    ) -> std::result::Result<T::Connection, TransportError> {
        let service_name = entry.config.service_name.as_str();
        let address = self.endpoint(entry).await?;
        let result = self.transport.dial(&address, attempt_timeout).await;

        if let Some(metrics) = &self.metrics {
            metrics.record_dial(service_name, result.is_ok());
        }
        match &result {
            Ok(conn) => debug!("Dialed {} for {}", conn.address(), service_name),
            Err(e) => debug!("Dial for {} failed: {}", service_name, e),
        }
        result
    }

    /// Pick the endpoint for the next dial
    async fn endpoint(&self, entry: &ClientEntry) -> std::result::Result<String, TransportError> {
        let service_name = entry.config.service_name.as_str();
        let unavailable = |reason: String| TransportError::Dial {
            address: service_name.to_string(),
            reason,
        };

        match entry.config.resolution {
            ResolutionMode::StaticList => entry
                .balancer
                .pick_or_first()
                .map_err(|e| unavailable(e.to_string())),
            ResolutionMode::Discovery => {
                let resolver = self
                    .resolver
                    .as_ref()
                    .ok_or_else(|| unavailable("no discovery resolver configured".to_string()))?;
                let endpoints = resolver
                    .resolve(service_name)
                    .await
                    .map_err(|e| unavailable(e.to_string()))?;
                entry
                    .balancer
                    .select_or_first(&endpoints)
                    .map_err(|e| unavailable(e.to_string()))
            }
        }
    }
}

/// A cached connection lent to one attempt. Dropping it before `release`
/// means the attempt was cancelled mid-call: a reply may still be in flight
/// on the connection, so it must not serve the next caller.
struct Checkout<'a, C: Connection> {
    cache: &'a Arc<ConnectionCache<C>>,
    service_name: &'a str,
    conn: Option<Arc<C>>,
}

impl<'a, C: Connection> Checkout<'a, C> {
    fn new(cache: &'a Arc<ConnectionCache<C>>, service_name: &'a str, conn: Arc<C>) -> Self {
        Self {
            cache,
            service_name,
            conn: Some(conn),
        }
    }

    /// The call returned; the connection stays cached
    fn release(mut self) {
        self.conn = None;
    }
}

impl<C: Connection> Drop for Checkout<'_, C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            debug!("Attempt against {} cancelled mid-call", self.service_name);
            self.cache.evict_detached(self.service_name, conn);
        }
    }
}
