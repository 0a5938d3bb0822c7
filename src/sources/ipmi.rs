//! Chassis power from the BMC through the DCMI "Get Power Reading" command.
//!
//! The request is sent as a raw IPMI message with `ipmitool`, either to the
//! local BMC or to a remote one over `lanplus`. The response carries the
//! current power as a little-endian `u16` right after the group extension id.

use crate::error::{PowerError, Result};
use crate::metrics::data::{Metadata, PowerDomain};
use crate::metrics::traits::{PowerSource, ReadSemantics};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use super::{host_metadata, run_command, DEFAULT_COMMAND_TIMEOUT_MS};

const BACKEND: &str = "ipmi";

/// NetFn 0x2C (group extension), command 0x02, DCMI group 0xDC, system power statistics.
const DCMI_POWER_READING: [&str; 6] = ["0x2c", "0x02", "0xdc", "0x01", "0x00", "0x00"];
const DCMI_GROUP_EXTENSION: u8 = 0xdc;
/// Offset of the current-power LSB in the response data.
const CURRENT_POWER_OFFSET: usize = 1;
const STATE_OFFSET: usize = 17;
const MEASUREMENT_ACTIVE: u8 = 0x40;

/// Credentials for a remote BMC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpmiRemote {
    pub host: String,
    pub username: String,
    pub password: String,
    /// ipmitool interface, `lanplus` for IPMI 2.0
    pub interface: String,
}

impl IpmiRemote {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            password: password.into(),
            interface: "lanplus".to_string(),
        }
    }
}

/// Configuration for [`IpmiSource`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpmiConfig {
    pub executable: PathBuf,
    /// Remote BMC; `None` talks to the local BMC through the kernel driver
    pub remote: Option<IpmiRemote>,
    pub timeout_ms: u64,
}

impl Default for IpmiConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("ipmitool"),
            remote: None,
            timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
        }
    }
}

impl IpmiConfig {
    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = executable.into();
        self
    }

    pub fn with_remote(mut self, remote: IpmiRemote) -> Self {
        self.remote = Some(remote);
        self
    }

    fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(remote) = &self.remote {
            // -E takes the password from IPMI_PASSWORD so it stays off the command line
            args.extend(
                [
                    "-I",
                    remote.interface.as_str(),
                    "-H",
                    remote.host.as_str(),
                    "-U",
                    remote.username.as_str(),
                    "-E",
                ]
                .map(String::from),
            );
        }
        args.push("raw".to_string());
        args.extend(DCMI_POWER_READING.map(String::from));
        args
    }
}

/// Instantaneous chassis power reported by a BMC over DCMI.
#[derive(Debug)]
pub struct IpmiSource {
    config: IpmiConfig,
    args: Vec<String>,
    metadata: Metadata,
}

impl IpmiSource {
    /// Check the BMC answers a power reading before accepting it.
    pub async fn new(config: IpmiConfig) -> Result<Self> {
        if let Some(remote) = &config.remote {
            if remote.host.is_empty() || remote.username.is_empty() {
                return Err(PowerError::unavailable(
                    BACKEND,
                    "remote BMC needs a host and username",
                ));
            }
        }

        let mut source = Self {
            args: config.args(),
            metadata: Metadata::new(),
            config,
        };

        let watts = source
            .read()
            .await
            .map_err(|e| PowerError::unavailable(BACKEND, e.to_string()))?;

        let mut metadata = host_metadata();
        metadata.insert("monitor_type".to_string(), BACKEND.into());
        metadata.insert(
            "target".to_string(),
            source
                .config
                .remote
                .as_ref()
                .map_or("local".to_string(), |r| r.host.clone())
                .into(),
        );
        source.metadata = metadata;

        info!("BMC reports {:.0}W through DCMI", watts);
        Ok(source)
    }
}

#[async_trait]
impl PowerSource for IpmiSource {
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
        let envs: Vec<(&str, &str)> = self
            .config
            .remote
            .iter()
            .map(|r| ("IPMI_PASSWORD", r.password.as_str()))
            .collect();

        let output = run_command(
            BACKEND,
            &self.config.executable,
            &self.args,
            &envs,
            Duration::from_millis(self.config.timeout_ms),
        )
        .await?;

        parse_dcmi_power(&output)
    }

    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }

    fn read_timeout(&self) -> Option<Duration> {
        Some(Duration::from_millis(self.config.timeout_ms))
    }
}

/// Extract the current power from `ipmitool raw` output (hex bytes).
pub fn parse_dcmi_power(output: &str) -> Result<f64> {
    let bytes = output
        .split_whitespace()
        .map(|token| {
            u8::from_str_radix(token.trim_start_matches("0x"), 16)
                .map_err(|e| PowerError::parse_error(format!("bad response byte {:?}: {}", token, e)))
        })
        .collect::<Result<Vec<u8>>>()?;

    if bytes.len() < CURRENT_POWER_OFFSET + 2 {
        return Err(PowerError::parse_error(format!(
            "DCMI response too short: {} bytes",
            bytes.len()
        )));
    }
    if bytes[0] != DCMI_GROUP_EXTENSION {
        return Err(PowerError::parse_error(format!(
            "unexpected group extension 0x{:02x}",
            bytes[0]
        )));
    }
    if let Some(state) = bytes.get(STATE_OFFSET) {
        if state & MEASUREMENT_ACTIVE == 0 {
            return Err(PowerError::read_error(BACKEND, "power measurement is not active"));
        }
    }

    let watts = u16::from_le_bytes([bytes[CURRENT_POWER_OFFSET], bytes[CURRENT_POWER_OFFSET + 1]]);
    Ok(f64::from(watts))
}

#[cfg(test)]
mod tests {
    use super::*;

    // 0x01a4 = 420 W current, state byte 0x40 (active)
    const RESPONSE: &str = " dc a4 01 10 01 f4 01 a0 01 8b 7c 4f 67 e8 03 00\n 00 40\n";

    #[test]
    fn test_parse_dcmi_power() {
        assert_eq!(parse_dcmi_power(RESPONSE).unwrap(), 420.0);
    }

    #[test]
    fn test_inactive_measurement_is_rejected() {
        let inactive = RESPONSE.replace("00 40", "00 00");
        assert!(parse_dcmi_power(&inactive).is_err());
    }

    #[test]
    fn test_bad_responses() {
        assert!(parse_dcmi_power("").is_err());
        assert!(parse_dcmi_power("dc 01").is_err());
        assert!(parse_dcmi_power("00 a4 01").is_err());
        assert!(parse_dcmi_power("dc zz 01").is_err());
    }

    #[test]
    fn test_remote_args_keep_password_off_command_line() {
        let config = IpmiConfig::default().with_remote(IpmiRemote::new("bmc01", "root", "secret"));
        let args = config.args();
        assert_eq!(&args[..7], ["-I", "lanplus", "-H", "bmc01", "-U", "root", "-E"]);
        assert!(!args.iter().any(|a| a == "secret"));
        assert_eq!(args.last().map(String::as_str), Some("0x00"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fake_ipmitool() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("ipmitool");
        std::fs::write(&script, format!("#!/bin/sh\nprintf '{}'\n", RESPONSE.replace('\n', "\\n"))).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut source = IpmiSource::new(IpmiConfig::default().with_executable(&script))
            .await
            .unwrap();
        assert_eq!(source.read().await.unwrap(), 420.0);
        assert_eq!(source.metadata()["target"], "local");
    }

    #[tokio::test]
    async fn test_missing_ipmitool_is_unavailable() {
        let config = IpmiConfig::default().with_executable("/nonexistent/ipmitool");
        assert!(IpmiSource::new(config).await.unwrap_err().is_unavailable());
    }
}
