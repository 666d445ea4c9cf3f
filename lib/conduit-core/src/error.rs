use crate::config::Protocol;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Failure of a single dial or call against the underlying transport.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("dial {address} failed: {reason}")]
    Dial { address: String, reason: String },

    #[error("call to {address} failed: {reason}")]
    Call { address: String, reason: String },

    #[error("{address} responded with status {status}")]
    Status { address: String, status: u16 },

    #[error("attempt against {target} timed out after {timeout_ms} ms")]
    Timeout { target: String, timeout_ms: u64 },

    #[error("connection to {0} is no longer usable")]
    Disconnected(String),

    #[error("close failed: {0}")]
    Closed(String),
}

impl TransportError {
    pub fn is_disconnect(&self) -> bool {
        matches!(self, TransportError::Disconnected(_))
    }

    /// Whether the connection that produced this error should be dropped from
    /// the connection cache. A timed-out call may still get its reply later.
    pub fn leaves_connection_unusable(&self) -> bool {
        matches!(
            self,
            TransportError::Disconnected(_) | TransportError::Timeout { .. }
        )
    }
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Service {service} is configured for {configured} but was called over {requested}")]
    ProtocolMismatch {
        service: String,
        configured: Protocol,
        requested: Protocol,
    },

    #[error("No endpoints configured for service: {0}")]
    EmptyEndpointSet(String),

    #[error("Call to {service} failed after {attempts} attempts (total timeout {timeout_ms} ms): {source}")]
    AllRetriesExhausted {
        service: String,
        attempts: u32,
        timeout_ms: u64,
        #[source]
        source: TransportError,
    },

    #[error("Call to {service} timed out after {timeout_ms} ms total, {attempts} attempts configured")]
    OperationTimeout {
        service: String,
        timeout_ms: u64,
        attempts: u32,
    },

    #[error("Discovery registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Discovery renewal failed: {0}")]
    RenewalFailed(String),

    #[error("Discovery deregistration failed: {0}")]
    DeregistrationFailed(String),

    #[error("{protocol} listener failed to bind {address}: {reason}")]
    ListenerBindFailed {
        protocol: Protocol,
        address: String,
        reason: String,
    },

    #[error("Invalid service configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Failed to read configuration {path}: {source}")]
    ConfigIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<toml::de::Error> for CoreError {
    fn from(err: toml::de::Error) -> Self {
        CoreError::ConfigParse(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::ConfigParse(err.to_string())
    }
}
