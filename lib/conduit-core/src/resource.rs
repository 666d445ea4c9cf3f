//! Collaborators the runtime only needs a narrow contract from

use crate::Result;
use async_trait::async_trait;

/// A pool or cache that must be released on shutdown (database pools,
/// key-value pools, connection caches)
#[async_trait]
pub trait ResourcePool: Send + Sync {
    fn name(&self) -> &str;

    async fn close(&self) -> Result<()>;
}

/// Looks up the live endpoints of a logical service
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, service_name: &str) -> Result<Vec<String>>;
}
