//! Core types for service connectivity
//!
//! This library provides:
//! - Typed configuration and its validation
//! - Endpoint sets and load balancing
//! - The service client registry
//! - Error taxonomy shared by clients, discovery and the server
//! - Narrow collaborator contracts (logger, resource pools, resolvers)

pub mod config;
pub mod endpoint;
pub mod error;
pub mod load_balancer;
pub mod logging;
pub mod registry;
pub mod resource;

pub use config::{BalancerStrategy, Config, Protocol, ResolutionMode, ServiceEndpointConfig};
pub use endpoint::EndpointSet;
pub use error::{CoreError, Result, TransportError};
pub use load_balancer::{BalancerHandle, LoadBalancer};
pub use logging::{default_logger, Logger, TracingLogger};
pub use registry::{ClientEntry, ClientRegistry};
pub use resource::{ResourcePool, Resolver};
