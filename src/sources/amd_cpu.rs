//! AMD CPU package power from a hwmon sensor (`power1_input`, microwatts).

use crate::error::{PowerError, Result};
use crate::metrics::data::{Metadata, PowerDomain};
use crate::metrics::traits::{PowerSource, ReadSemantics};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

use super::{host_metadata, read_trimmed, read_u64, sorted_subdirs};

const BACKEND: &str = "amd_hwmon";

/// Configuration for [`AmdCpuSource`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmdCpuConfig {
    /// Directory holding the `hwmonN` entries
    pub hwmon_root: PathBuf,
    /// Use this hwmon directory instead of scanning `hwmon_root`
    pub hwmon_path: Option<PathBuf>,
    /// Driver names accepted as CPU power sensors
    pub drivers: Vec<String>,
}

impl Default for AmdCpuConfig {
    fn default() -> Self {
        Self {
            hwmon_root: PathBuf::from("/sys/class/hwmon"),
            hwmon_path: None,
            drivers: vec!["k10temp".to_string(), "zenpower".to_string()],
        }
    }
}

impl AmdCpuConfig {
    pub fn with_hwmon_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.hwmon_root = root.into();
        self
    }

    pub fn with_hwmon_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.hwmon_path = Some(path.into());
        self
    }
}

/// Instantaneous CPU power from an AMD hwmon driver.
#[derive(Debug)]
pub struct AmdCpuSource {
    power_path: PathBuf,
    metadata: Metadata,
}

impl AmdCpuSource {
    pub fn new(config: AmdCpuConfig) -> Result<Self> {
        let candidates = match &config.hwmon_path {
            Some(path) => vec![path.clone()],
            None => sorted_subdirs(&config.hwmon_root),
        };

        let found = candidates.into_iter().find_map(|dir| {
            let driver = read_trimmed(&dir.join("name")).ok()?.to_lowercase();
            let accepted = config.drivers.iter().any(|d| driver.contains(d.as_str()));
            let power_path = dir.join("power1_input");
            (accepted && power_path.exists()).then_some((driver, power_path))
        });

        let Some((driver, power_path)) = found else {
            return Err(PowerError::unavailable(
                BACKEND,
                format!(
                    "no {:?} hwmon sensor with power1_input under {}",
                    config.drivers,
                    config
                        .hwmon_path
                        .as_ref()
                        .unwrap_or(&config.hwmon_root)
                        .display()
                ),
            ));
        };

        read_u64(&power_path).map_err(|e| {
            PowerError::unavailable(BACKEND, format!("cannot read {}: {}", power_path.display(), e))
        })?;

        let mut metadata = host_metadata();
        metadata.insert("monitor_type".to_string(), BACKEND.into());
        metadata.insert("driver".to_string(), driver.clone().into());
        metadata.insert(
            "power_path".to_string(),
            power_path.display().to_string().into(),
        );

        info!("Using AMD CPU power sensor {} ({})", power_path.display(), driver);
        Ok(Self {
            power_path,
            metadata,
        })
    }
}

#[async_trait]
impl PowerSource for AmdCpuSource {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn domain(&self) -> PowerDomain {
        PowerDomain::Cpu
    }

    fn semantics(&self) -> ReadSemantics {
        ReadSemantics::Instantaneous
    }

    async fn read(&mut self) -> Result<f64> {
        let microwatts = read_u64(&self.power_path)?;
        Ok(microwatts as f64 / 1e6)
    }

    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn hwmon(root: &std::path::Path, index: u32, name: &str, power_uw: Option<u64>) {
        let dir = root.join(format!("hwmon{}", index));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("name"), format!("{}\n", name)).unwrap();
        if let Some(power) = power_uw {
            fs::write(dir.join("power1_input"), format!("{}\n", power)).unwrap();
        }
    }

    #[tokio::test]
    async fn test_scans_for_matching_driver() {
        let root = tempfile::tempdir().unwrap();
        hwmon(root.path(), 0, "acpitz", None);
        hwmon(root.path(), 1, "k10temp", Some(65_500_000));

        let mut source =
            AmdCpuSource::new(AmdCpuConfig::default().with_hwmon_root(root.path())).unwrap();
        assert_eq!(source.read().await.unwrap(), 65.5);
        assert_eq!(source.semantics(), ReadSemantics::Instantaneous);
        assert_eq!(source.metadata()["driver"], "k10temp");
    }

    #[test]
    fn test_driver_without_power_attribute_fails() {
        let root = tempfile::tempdir().unwrap();
        hwmon(root.path(), 0, "k10temp", None);

        let err = AmdCpuSource::new(AmdCpuConfig::default().with_hwmon_root(root.path())).unwrap_err();
        assert!(err.is_unavailable());
    }

    #[test]
    fn test_explicit_path_must_match_driver() {
        let root = tempfile::tempdir().unwrap();
        hwmon(root.path(), 3, "nvme", Some(1_000));

        let config = AmdCpuConfig::default().with_hwmon_path(root.path().join("hwmon3"));
        assert!(AmdCpuSource::new(config).unwrap_err().is_unavailable());
    }
}
