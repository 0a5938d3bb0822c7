//! Chassis power from a Redfish service (Dell iDRAC and compatible BMCs).

use crate::error::{PowerError, Result};
use crate::metrics::data::{Metadata, PowerDomain};
use crate::metrics::traits::{PowerSource, ReadSemantics};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::info;

use super::host_metadata;

const BACKEND: &str = "redfish";

/// Configuration for [`RedfishSource`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedfishConfig {
    pub host: String,
    pub username: String,
    pub password: String,
    /// `https` for real controllers
    pub scheme: String,
    /// Resource holding the chassis power readings
    pub power_path: String,
    /// iDRACs ship with self-signed certificates
    pub accept_invalid_certs: bool,
    pub timeout_ms: u64,
}

impl RedfishConfig {
    /// Configuration for an iDRAC's embedded chassis.
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            password: password.into(),
            scheme: "https".to_string(),
            power_path: "/redfish/v1/Chassis/System.Embedded.1/Power".to_string(),
            accept_invalid_certs: true,
            timeout_ms: 5_000,
        }
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    pub fn with_power_path(mut self, path: impl Into<String>) -> Self {
        self.power_path = path.into();
        self
    }

    pub fn with_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Full URL of the power resource.
    pub fn url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.host, self.power_path)
    }
}

/// Instantaneous chassis power polled over authenticated HTTPS.
#[derive(Debug)]
pub struct RedfishSource {
    client: Client,
    config: RedfishConfig,
    url: String,
    metadata: Metadata,
}

impl RedfishSource {
    /// Validate the credentials and fetch one reading before accepting the controller.
    pub async fn new(config: RedfishConfig) -> Result<Self> {
        if config.host.is_empty() || config.username.is_empty() || config.password.is_empty() {
            return Err(PowerError::unavailable(
                BACKEND,
                "host, username and password are all required",
            ));
        }

        let client = Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(format!("power_profiling/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PowerError::unavailable(BACKEND, format!("HTTP client: {}", e)))?;

        let mut metadata = host_metadata();
        metadata.insert("monitor_type".to_string(), BACKEND.into());
        metadata.insert("controller".to_string(), config.host.clone().into());

        let mut source = Self {
            client,
            url: config.url(),
            config,
            metadata,
        };

        let watts = source
            .read()
            .await
            .map_err(|e| PowerError::unavailable(BACKEND, e.to_string()))?;
        info!("{} reports {:.0}W", source.url, watts);

        Ok(source)
    }
}

#[async_trait]
impl PowerSource for RedfishSource {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn domain(&self) -> PowerDomain {
        PowerDomain::System
    }

    fn semantics(&self) -> ReadSemantics {
        ReadSemantics::Instantaneous
    }

    async fn read(&mut self) -> Result<f64> {
        let document: Value = self
            .client
            .get(&self.url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        power_consumed_watts(&document)
    }

    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }

    fn read_timeout(&self) -> Option<Duration> {
        Some(Duration::from_millis(self.config.timeout_ms))
    }
}

/// Find the consumed-watts value in a Redfish power document.
///
/// Accepts a top-level `PowerConsumedWatts`, the first `PowerControl` entry
/// of a `Power` resource, or `PowerWatts.Reading` from environment metrics.
pub fn power_consumed_watts(document: &Value) -> Result<f64> {
    let candidates = [
        document.get("PowerConsumedWatts"),
        document
            .get("PowerControl")
            .and_then(|control| control.get(0))
            .and_then(|entry| entry.get("PowerConsumedWatts")),
        document
            .get("PowerWatts")
            .and_then(|watts| watts.get("Reading")),
    ];

    candidates
        .into_iter()
        .flatten()
        .find_map(Value::as_f64)
        .ok_or_else(|| PowerError::parse_error("no PowerConsumedWatts in Redfish response"))
}
