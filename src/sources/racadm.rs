//! Chassis power from a local iDRAC through `racadm`.

use crate::error::{PowerError, Result};
use crate::metrics::data::{Metadata, PowerDomain};
use crate::metrics::traits::{PowerSource, ReadSemantics};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use super::{host_metadata, run_command, DEFAULT_COMMAND_TIMEOUT_MS};

const BACKEND: &str = "idrac_racadm";
const POWER_READING: &str = "System.ServerPwr.PowerReading";
const POWER_STATISTICS: &str = "System.ServerPwr.Statistics";

/// Configuration for [`RacadmSource`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RacadmConfig {
    pub executable: PathBuf,
    pub timeout_ms: u64,
}

impl Default for RacadmConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("racadm"),
            timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
        }
    }
}

impl RacadmConfig {
    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = executable.into();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// Instantaneous system power as reported by `racadm get System.ServerPwr.PowerReading`.
#[derive(Debug)]
pub struct RacadmSource {
    config: RacadmConfig,
    metadata: Metadata,
}

impl RacadmSource {
    pub async fn new(config: RacadmConfig) -> Result<Self> {
        let mut source = Self {
            config,
            metadata: Metadata::new(),
        };

        let watts = source
            .read()
            .await
            .map_err(|e| PowerError::unavailable(BACKEND, e.to_string()))?;

        let mut metadata = host_metadata();
        metadata.insert("monitor_type".to_string(), BACKEND.into());
        match source.get(POWER_STATISTICS).await {
            Ok(output) => {
                let system_info: serde_json::Map<String, serde_json::Value> = parse_key_values(&output)
                    .map(|(key, value)| (key.to_string(), value.to_string().into()))
                    .collect();
                metadata.insert("system_info".to_string(), system_info.into());
            }
            Err(e) => warn!("{}: could not read power statistics: {}", BACKEND, e),
        }
        source.metadata = metadata;

        info!("iDRAC reports {:.0}W", watts);
        Ok(source)
    }

    async fn get(&self, group: &str) -> Result<String> {
        run_command(
            BACKEND,
            &self.config.executable,
            &["get".to_string(), group.to_string()],
            &[],
            Duration::from_millis(self.config.timeout_ms),
        )
        .await
    }
}

#[async_trait]
impl PowerSource for RacadmSource {
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
        let output = self.get(POWER_READING).await?;
        parse_power_reading(&output)
    }

    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }

    fn read_timeout(&self) -> Option<Duration> {
        Some(Duration::from_millis(self.config.timeout_ms))
    }
}

fn parse_key_values(output: &str) -> impl Iterator<Item = (&str, &str)> {
    output
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim(), value.trim()))
}

/// Find the `PowerReading=<watts>` line in `racadm get` output.
///
/// Some firmware appends a unit (`PowerReading=312 W`); it is ignored.
pub fn parse_power_reading(output: &str) -> Result<f64> {
    let (_, value) = parse_key_values(output)
        .find(|(key, _)| key.contains("PowerReading"))
        .ok_or_else(|| PowerError::parse_error("no PowerReading in racadm output"))?;

    let number = value.trim_end_matches('W').trim();
    number
        .parse::<f64>()
        .map_err(|e| PowerError::parse_error(format!("bad PowerReading {:?}: {}", value, e)))
}
