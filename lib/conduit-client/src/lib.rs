//! Client side of conduit: transports, connection caching and the retrying
//! call executor
pub mod cache;
pub mod client;
pub mod executor;
pub mod http;
pub mod metrics;
pub mod policy;
pub mod transport;

pub use cache::ConnectionCache;
pub use client::ServiceClient;
pub use executor::CallExecutor;
pub use http::{HttpConnection, HttpRequest, HttpTransport};
pub use metrics::{CallOutcome, MetricsCollector};
pub use policy::CallPolicy;
pub use transport::{Connection, RequestOf, ResponseOf, Transport};
