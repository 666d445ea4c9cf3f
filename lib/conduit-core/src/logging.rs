//! Pluggable logging capability
//!
//! Components that report configuration and lifecycle problems take a
//! `Logger` so applications can route those messages into their own logging
//! backend. The default forwards to `tracing`.

use std::sync::Arc;
use tracing::{error, info};

pub trait Logger: Send + Sync {
    fn info(&self, message: &str);
    fn error(&self, message: &str);
}

/// `Logger` backed by the `tracing` macros
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn info(&self, message: &str) {
        info!(target: "conduit", "{}", message);
    }

    fn error(&self, message: &str) {
        error!(target: "conduit", "{}", message);
    }
}

pub fn default_logger() -> Arc<dyn Logger> {
    Arc::new(TracingLogger)
}
