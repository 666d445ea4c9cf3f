//! Typed configuration
//!
//! The on-disk form (TOML, or JSON when the file ends in `.json`) is parsed
//! into loosely typed `Raw*` structs first and validated once into the typed
//! values the runtime works with. String enums are resolved here so nothing
//! downstream ever sees an unknown protocol or balancer name.

use crate::endpoint::EndpointSet;
use crate::logging::Logger;
use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 1;
pub const DEFAULT_CONSUL_HOST: &str = "127.0.0.1";
pub const DEFAULT_CONSUL_PORT: u16 = 8500;
pub const DEFAULT_TTL_SECS: u64 = 30;

/// Wire protocol of a client entry or a server listener
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Rpc,
    Http,
}

impl Protocol {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "rpc" | "grpc" => Some(Protocol::Rpc),
            "http" => Some(Protocol::Http),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Rpc => write!(f, "rpc"),
            Protocol::Http => write!(f, "http"),
        }
    }
}

/// How a client entry finds its endpoints
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ResolutionMode {
    /// Fixed list from the `endpoints` key (`type = "local"`)
    #[default]
    StaticList,
    /// Live lookup in the discovery directory (`type = "consul"`)
    Discovery,
}

impl ResolutionMode {
    pub fn parse(value: Option<&str>) -> Option<Self> {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            None => Some(ResolutionMode::StaticList),
            Some(v) if v.is_empty() || v == "local" || v == "static" => {
                Some(ResolutionMode::StaticList)
            }
            Some(v) if v == "consul" || v == "discovery" => Some(ResolutionMode::Discovery),
            Some(_) => None,
        }
    }
}

/// Endpoint selection policy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BalancerStrategy {
    /// Always the first endpoint
    #[default]
    First,
    /// Successive endpoints, wrapping around
    RoundRobin,
    /// Uniform draw with replacement
    Random,
}

impl BalancerStrategy {
    /// Parse a `balance_type` value. `None` means unspecified and maps to
    /// `First`; an unknown name is an error the caller reports.
    pub fn parse(value: Option<&str>) -> std::result::Result<Self, String> {
        let Some(value) = value else {
            return Ok(BalancerStrategy::First);
        };
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "first" => Ok(BalancerStrategy::First),
            "roundrobin" | "round_robin" | "round-robin" => Ok(BalancerStrategy::RoundRobin),
            "random" => Ok(BalancerStrategy::Random),
            other => Err(format!("unknown balance_type '{}'", other)),
        }
    }
}

/// Validated client entry
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceEndpointConfig {
    pub service_name: String,
    pub protocol: Protocol,
    pub resolution: ResolutionMode,
    pub static_endpoints: EndpointSet,
    /// Budget for the whole call, across every attempt
    pub overall_timeout: Duration,
    pub retry_attempts: u32,
    pub per_attempt_timeout: Duration,
    pub balancer: BalancerStrategy,
}

impl ServiceEndpointConfig {
    /// Static-list entry with default timeouts, a single attempt and the
    /// `First` balancer.
    pub fn new_static(
        service_name: impl Into<String>,
        protocol: Protocol,
        endpoints: Vec<String>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            protocol,
            resolution: ResolutionMode::StaticList,
            static_endpoints: EndpointSet::new(endpoints),
            overall_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            per_attempt_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            balancer: BalancerStrategy::First,
        }
    }

    /// Entry resolved through the discovery directory
    pub fn new_discovery(service_name: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            resolution: ResolutionMode::Discovery,
            ..Self::new_static(service_name, protocol, Vec::new())
        }
    }

    pub fn with_balancer(mut self, strategy: BalancerStrategy) -> Self {
        self.balancer = strategy;
        self
    }

    pub fn with_retry(
        mut self,
        attempts: u32,
        per_attempt_timeout: Duration,
        overall_timeout: Duration,
    ) -> Self {
        self.retry_attempts = attempts;
        self.per_attempt_timeout = per_attempt_timeout;
        self.overall_timeout = overall_timeout;
        self
    }

    pub fn overall_timeout_ms(&self) -> u64 {
        self.overall_timeout.as_millis() as u64
    }

    /// Check the invariants every registry entry must hold
    pub fn validate(&self) -> Result<()> {
        if self.service_name.trim().is_empty() {
            return Err(CoreError::InvalidConfiguration(
                "client entry without service_name".to_string(),
            ));
        }
        if self.resolution == ResolutionMode::StaticList && self.static_endpoints.is_empty() {
            return Err(CoreError::InvalidConfiguration(format!(
                "check endpoints failed, empty address list, service_name: {}",
                self.service_name
            )));
        }
        if self.overall_timeout.is_zero() || self.per_attempt_timeout.is_zero() {
            return Err(CoreError::InvalidConfiguration(format!(
                "timeouts must be positive, service_name: {}",
                self.service_name
            )));
        }
        if self.retry_attempts == 0 {
            return Err(CoreError::InvalidConfiguration(format!(
                "retry_times must be at least 1, service_name: {}",
                self.service_name
            )));
        }
        Ok(())
    }
}

/// `[[client]]` table as written in the configuration file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RawClientConfig {
    #[serde(default)]
    pub service_name: String,
    /// `rpc` or `http`
    #[serde(default)]
    pub proto: String,
    /// `local` (static list) or `consul` (discovery)
    #[serde(rename = "type", default)]
    pub call_type: Option<String>,
    /// Comma separated addresses, used when `type` is `local`
    #[serde(default)]
    pub endpoints: String,
    #[serde(default)]
    pub balance_type: Option<String>,
    /// Total timeout in milliseconds, retries included
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub retry_times: Option<u32>,
    /// Timeout of every single attempt in milliseconds
    #[serde(default)]
    pub per_retry_timeout: Option<u64>,
}

impl RawClientConfig {
    /// Resolve the string fields into a typed entry. Soft problems (unknown
    /// balancer) are reported through `logger` and defaulted; hard ones fail.
    pub fn validate(&self, logger: &dyn Logger) -> Result<ServiceEndpointConfig> {
        let protocol = Protocol::parse(&self.proto).ok_or_else(|| {
            CoreError::InvalidConfiguration(format!(
                "invalid proto '{}', service_name: {}",
                self.proto, self.service_name
            ))
        })?;

        let resolution = ResolutionMode::parse(self.call_type.as_deref()).ok_or_else(|| {
            CoreError::InvalidConfiguration(format!(
                "invalid type '{}', service_name: {}",
                self.call_type.as_deref().unwrap_or_default(),
                self.service_name
            ))
        })?;

        let balancer = match BalancerStrategy::parse(self.balance_type.as_deref()) {
            Ok(strategy) => strategy,
            Err(reason) => {
                logger.error(&format!(
                    "{}, service_name: {}, falling back to first endpoint",
                    reason, self.service_name
                ));
                BalancerStrategy::First
            }
        };

        let timeout_ms = self.timeout.unwrap_or(DEFAULT_TIMEOUT_MS);
        let per_attempt_ms = self.per_retry_timeout.unwrap_or(timeout_ms);

        let config = ServiceEndpointConfig {
            service_name: self.service_name.trim().to_string(),
            protocol,
            resolution,
            static_endpoints: EndpointSet::parse(&self.endpoints),
            overall_timeout: Duration::from_millis(timeout_ms),
            retry_attempts: self.retry_times.unwrap_or(DEFAULT_RETRY_ATTEMPTS),
            per_attempt_timeout: Duration::from_millis(per_attempt_ms),
            balancer,
        };
        config.validate()?;
        Ok(config)
    }
}

/// `[server]`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub service_name: String,
    /// Bind host for every listener
    pub address: String,
    /// RPC listener port, 0 when not requested
    pub port: u16,
    /// HTTP listener port, 0 when not requested
    pub http_port: u16,
    /// Address published to discovery; detected when absent
    pub advertise_address: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            address: "0.0.0.0".to_string(),
            port: 0,
            http_port: 0,
            advertise_address: None,
        }
    }
}

impl ServerSettings {
    /// Port of the listener for `protocol`, `None` when not requested
    pub fn port_for(&self, protocol: Protocol) -> Option<u16> {
        let port = match protocol {
            Protocol::Rpc => self.port,
            Protocol::Http => self.http_port,
        };
        (port != 0).then_some(port)
    }
}

/// `[discovery]` (also accepted as `[consul]`)
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub ttl_secs: u64,
    pub renew_interval_secs: Option<u64>,
    pub request_timeout_ms: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: DEFAULT_CONSUL_HOST.to_string(),
            port: DEFAULT_CONSUL_PORT,
            ttl_secs: DEFAULT_TTL_SECS,
            renew_interval_secs: None,
            request_timeout_ms: 2000,
        }
    }
}

impl DiscoverySettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs.max(1))
    }

    /// Renewal period; a third of the TTL unless configured
    pub fn renew_interval(&self) -> Duration {
        match self.renew_interval_secs {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => self.ttl() / 3,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }

    pub fn agent_url(&self) -> String {
        let host = if self.host.is_empty() {
            DEFAULT_CONSUL_HOST
        } else {
            self.host.as_str()
        };
        format!("http://{}:{}", host, self.port)
    }
}

/// `[metrics]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
    /// Port of the `/metrics` endpoint, 0 disables the endpoint
    pub port: u16,
}

/// `[pprof]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilingSettings {
    pub port: u16,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKind {
    #[default]
    AlwaysPass,
    NoBlock,
}

/// `[rate_limit]`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    #[serde(rename = "type")]
    pub kind: RateLimitKind,
    pub capacity: u64,
    pub fill_interval_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            kind: RateLimitKind::AlwaysPass,
            capacity: 100,
            fill_interval_ms: 10,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// `[log]`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Whole configuration file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSettings,
    pub log: LogSettings,
    pub metrics: MetricsSettings,
    pub pprof: ProfilingSettings,
    #[serde(alias = "consul")]
    pub discovery: DiscoverySettings,
    pub rate_limit: RateLimitSettings,
    #[serde(rename = "client")]
    pub clients: Vec<RawClientConfig>,
}

impl Config {
    /// Load from disk; JSON when the extension is `.json`, TOML otherwise
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| CoreError::ConfigIo {
            path: path.display().to_string(),
            source,
        })?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_toml_str(&content),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }
}
