//! Consul agent HTTP API implementation of the discovery directory

use crate::directory::{DiscoveryDirectory, ServiceRegistration};
use async_trait::async_trait;
use conduit_core::config::DiscoverySettings;
use conduit_core::{CoreError, Resolver, Result};
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Talks to the local Consul agent
pub struct ConsulDirectory {
    http_client: HttpClient,
    base_url: String,
    token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    address: &'a str,
    port: u16,
    tags: &'a [String],
    check: AgentServiceCheck<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceCheck<'a> {
    #[serde(rename = "CheckID")]
    check_id: &'a str,
    name: &'a str,
    #[serde(rename = "TTL")]
    ttl: String,
    status: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    #[serde(default)]
    node: HealthNode,
    service: HealthService,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthNode {
    #[serde(default)]
    address: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthService {
    #[serde(default)]
    address: String,
    port: u16,
}

impl HealthEntry {
    /// Service address wins; Consul leaves it empty when the instance
    /// registered without one and the node address applies
    fn endpoint(&self) -> Option<String> {
        let host = if self.service.address.is_empty() {
            self.node.address.as_str()
        } else {
            self.service.address.as_str()
        };
        (!host.is_empty()).then(|| format!("{}:{}", host, self.service.port))
    }
}

fn ttl_string(ttl: Duration) -> String {
    format!("{}s", ttl.as_secs().max(1))
}

impl ConsulDirectory {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let http_client = HttpClient::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| CoreError::Internal(format!("failed to build consul http client: {}", e)))?;
        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    pub fn from_settings(settings: &DiscoverySettings) -> Result<Self> {
        Self::new(settings.agent_url(), settings.request_timeout())
    }

    /// ACL token sent as `X-Consul-Token`
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header("X-Consul-Token", token),
            None => request,
        }
    }

    /// PUT without body, returning a readable error on non-2xx
    async fn put(&self, path: &str) -> std::result::Result<(), String> {
        let request = self.authorize(self.http_client.put(self.url(path)));
        let response = request.send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("HTTP {}: {}", status, body.trim()));
        }
        Ok(())
    }
}

#[async_trait]
impl DiscoveryDirectory for ConsulDirectory {
    async fn register(&self, registration: &ServiceRegistration) -> Result<()> {
        let body = AgentServiceRegistration {
            id: &registration.service_id,
            name: &registration.name,
            address: &registration.address,
            port: registration.port,
            tags: &registration.tags,
            check: AgentServiceCheck {
                check_id: &registration.check_id,
                name: &registration.name,
                ttl: ttl_string(registration.ttl),
                status: "passing",
            },
        };

        let request = self
            .authorize(self.http_client.put(self.url("/agent/service/register")))
            .json(&body);
        let response = request.send().await.map_err(|e| {
            CoreError::RegistrationFailed(format!(
                "register service '{}' to consul error: {}",
                registration.name, e
            ))
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(CoreError::RegistrationFailed(format!(
                "register service '{}' to consul error: HTTP {}: {}",
                registration.name,
                status,
                text.trim()
            )));
        }

        info!(
            "Registered {} as {} with check {}",
            registration.name, registration.service_id, registration.check_id
        );
        Ok(())
    }

    async fn deregister(&self, service_id: &str, check_id: &str) -> Result<()> {
        // both calls are attempted even if the first one fails
        let check = self
            .put(&format!("/agent/check/deregister/{}", check_id))
            .await;
        let service = self
            .put(&format!("/agent/service/deregister/{}", service_id))
            .await;

        let failures: Vec<String> = [("check", check), ("service", service)]
            .into_iter()
            .filter_map(|(what, result)| result.err().map(|e| format!("{} {}", what, e)))
            .collect();

        if failures.is_empty() {
            info!("Deregistered {} from consul", service_id);
            Ok(())
        } else {
            Err(CoreError::DeregistrationFailed(format!(
                "deregister {} error: {}",
                service_id,
                failures.join("; ")
            )))
        }
    }

    async fn renew(&self, check_id: &str) -> Result<()> {
        self.put(&format!("/agent/check/pass/{}", check_id))
            .await
            .map_err(|e| CoreError::RenewalFailed(format!("update ttl of {} error: {}", check_id, e)))?;
        debug!("Renewed check {}", check_id);
        Ok(())
    }

    async fn lookup(&self, service_name: &str) -> Result<Vec<String>> {
        let request = self
            .authorize(
                self.http_client
                    .get(self.url(&format!("/health/service/{}", service_name))),
            )
            .query(&[("passing", "true")]);

        let lookup_error =
            |reason: String| CoreError::Internal(format!("consul lookup of {} failed: {}", service_name, reason));

        let response = request.send().await.map_err(|e| lookup_error(e.to_string()))?;
        if !response.status().is_success() {
            return Err(lookup_error(format!("HTTP {}", response.status())));
        }
        let entries: Vec<HealthEntry> = response
            .json()
            .await
            .map_err(|e| lookup_error(e.to_string()))?;

        let endpoints: Vec<String> = entries.iter().filter_map(HealthEntry::endpoint).collect();
        debug!("Consul returned {} passing instances of {}", endpoints.len(), service_name);
        Ok(endpoints)
    }
}

#[async_trait]
impl Resolver for ConsulDirectory {
    async fn resolve(&self, service_name: &str) -> Result<Vec<String>> {
        self.lookup(service_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_body_shape() {
        let reg = ServiceRegistration::new("echo", "10.0.0.5", 9000, Duration::from_secs(30));
        let body = AgentServiceRegistration {
            id: &reg.service_id,
            name: &reg.name,
            address: &reg.address,
            port: reg.port,
            tags: &reg.tags,
            check: AgentServiceCheck {
                check_id: &reg.check_id,
                name: &reg.name,
                ttl: ttl_string(reg.ttl),
                status: "passing",
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["ID"], "10.0.0.5-9000");
        assert_eq!(json["Name"], "echo");
        assert_eq!(json["Port"], 9000);
        assert_eq!(json["Check"]["CheckID"], "10.0.0.5-9000-ttl");
        assert_eq!(json["Check"]["TTL"], "30s");
        assert_eq!(json["Check"]["Status"], "passing");
    }

    #[test]
    fn test_health_entry_endpoint_falls_back_to_node() {
        let entries: Vec<HealthEntry> = serde_json::from_str(
            r#"[
                {"Node": {"Address": "10.0.0.1"}, "Service": {"Address": "", "Port": 9000}},
                {"Node": {"Address": "10.0.0.1"}, "Service": {"Address": "10.0.0.2", "Port": 9001}},
                {"Service": {"Port": 9002}}
            ]"#,
        )
        .unwrap();
        let endpoints: Vec<String> = entries.iter().filter_map(HealthEntry::endpoint).collect();
        assert_eq!(endpoints, vec!["10.0.0.1:9000", "10.0.0.2:9001"]);
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let dir = ConsulDirectory::new("http://127.0.0.1:8500/", Duration::from_secs(1)).unwrap();
        assert_eq!(dir.base_url(), "http://127.0.0.1:8500");
        assert_eq!(dir.url("/agent/check/pass/x"), "http://127.0.0.1:8500/v1/agent/check/pass/x");
    }
}
