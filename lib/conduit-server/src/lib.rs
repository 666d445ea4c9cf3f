//! Server side of conduit: listeners, connection admission, admin endpoints
//! and the lifecycle coordinator
pub mod admin;
pub mod coordinator;
pub mod handler;
pub mod limiter;
pub mod listener;
pub mod signal;

pub use admin::{AdminEndpoint, AdminState};
pub use coordinator::{ServerCoordinator, ServerState, ShutdownHandle, ShutdownTrigger};
pub use handler::{ConnectionHandler, HttpHandler};
pub use limiter::{AlwaysPass, Limiter, TokenBucket};
pub use listener::{ListenerHandle, ListenerState};
pub use signal::{wait_for_termination, TerminationSignal};
