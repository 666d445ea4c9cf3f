//! Load balancing strategies for distributing calls across endpoints

use crate::config::BalancerStrategy;
use crate::endpoint::EndpointSet;
use crate::{CoreError, Result};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Shared handle to a registered balancer
pub type BalancerHandle = Arc<LoadBalancer>;

/// Load balancer for selecting endpoints based on a strategy
#[derive(Debug)]
pub struct LoadBalancer {
    service_name: String,
    endpoints: EndpointSet,
    strategy: BalancerStrategy,
    round_robin_counter: AtomicUsize,
}

impl LoadBalancer {
    /// Register a balancer over a snapshot of `endpoints`
    pub fn register(
        service_name: impl Into<String>,
        endpoints: EndpointSet,
        strategy: BalancerStrategy,
    ) -> BalancerHandle {
        Arc::new(Self {
            service_name: service_name.into(),
            endpoints,
            strategy,
            round_robin_counter: AtomicUsize::new(0),
        })
    }

    pub fn strategy(&self) -> BalancerStrategy {
        self.strategy
    }

    pub fn endpoints(&self) -> &EndpointSet {
        &self.endpoints
    }

    /// Pick one endpoint from the registered snapshot
    pub fn pick(&self) -> Result<String> {
        self.select(self.endpoints.as_slice()).cloned()
    }

    /// Apply the strategy (and the shared cursor) to an externally supplied
    /// list, e.g. instances returned by discovery
    pub fn select<'a>(&self, endpoints: &'a [String]) -> Result<&'a String> {
        if endpoints.is_empty() {
            return Err(CoreError::EmptyEndpointSet(self.service_name.clone()));
        }
        if endpoints.len() == 1 {
            return Ok(&endpoints[0]);
        }

        let index = match self.strategy {
            BalancerStrategy::First => 0,
            BalancerStrategy::RoundRobin => {
                self.round_robin_counter.fetch_add(1, Ordering::SeqCst) % endpoints.len()
            }
            BalancerStrategy::Random => rand::thread_rng().gen_range(0..endpoints.len()),
        };
        endpoints
            .get(index)
            .ok_or_else(|| CoreError::Internal(format!("balancer index {} out of range", index)))
    }

    /// Like `select`, but a balancer failure falls back to the first
    /// endpoint instead of failing the call. Availability wins over surfacing
    /// balancer faults here.
    pub fn select_or_first(&self, endpoints: &[String]) -> Result<String> {
        match self.select(endpoints) {
            Ok(endpoint) => Ok(endpoint.clone()),
            Err(e) => match endpoints.first() {
                Some(first) => {
                    warn!(
                        "Balancer for {} failed ({}), using first endpoint {}",
                        self.service_name, e, first
                    );
                    Ok(first.clone())
                }
                None => Err(e),
            },
        }
    }

    /// `pick` with the first-endpoint fallback
    pub fn pick_or_first(&self) -> Result<String> {
        self.select_or_first(self.endpoints.as_slice())
    }
}
