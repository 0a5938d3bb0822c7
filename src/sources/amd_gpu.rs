//! AMD GPU board power from `amdgpu` hwmon sensors, summed over a device set.

use crate::error::{PowerError, Result};
use crate::metrics::data::{Metadata, PowerDomain};
use crate::metrics::traits::{PowerSource, ReadSemantics};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::{debug, info};

use super::{host_metadata, read_trimmed, read_u64, sorted_subdirs, sum_selected};

const BACKEND: &str = "amdgpu_hwmon";
const DRIVER: &str = "amdgpu";
/// Preferred attribute first; older kernels only expose the average.
const POWER_ATTRIBUTES: [&str; 2] = ["power1_input", "power1_average"];

/// Configuration for [`AmdGpuSource`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmdGpuConfig {
    pub hwmon_root: PathBuf,
    /// Device indices (order of `amdgpu` hwmon entries); `None` selects all
    pub gpu_ids: Option<Vec<u32>>,
}

impl Default for AmdGpuConfig {
    fn default() -> Self {
        Self {
            hwmon_root: PathBuf::from("/sys/class/hwmon"),
            gpu_ids: None,
        }
    }
}

impl AmdGpuConfig {
    pub fn with_hwmon_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.hwmon_root = root.into();
        self
    }

    pub fn with_gpu_ids(mut self, ids: impl IntoIterator<Item = u32>) -> Self {
        self.gpu_ids = Some(ids.into_iter().collect());
        self
    }
}

/// Sum of instantaneous power across selected AMD GPUs.
#[derive(Debug)]
pub struct AmdGpuSource {
    /// (device index, hwmon directory) for every detected GPU
    devices: Vec<(u32, PathBuf)>,
    selected: BTreeSet<u32>,
    metadata: Metadata,
}

impl AmdGpuSource {
    pub fn new(config: AmdGpuConfig) -> Result<Self> {
        let devices: Vec<(u32, PathBuf)> = sorted_subdirs(&config.hwmon_root)
            .into_iter()
            .filter(|dir| read_trimmed(&dir.join("name")).is_ok_and(|name| name == DRIVER))
            .zip(0u32..)
            .map(|(dir, index)| (index, dir))
            .collect();

        if devices.is_empty() {
            return Err(PowerError::unavailable(
                BACKEND,
                format!("no {} hwmon devices under {}", DRIVER, config.hwmon_root.display()),
            ));
        }

        let detected: BTreeSet<u32> = devices.iter().map(|(index, _)| *index).collect();
        let selected: BTreeSet<u32> = match config.gpu_ids {
            Some(ids) => ids.into_iter().collect(),
            None => detected.clone(),
        };
        if selected.is_disjoint(&detected) {
            return Err(PowerError::unavailable(
                BACKEND,
                format!("configured GPUs {:?} not present, detected {:?}", selected, detected),
            ));
        }

        let mut metadata = host_metadata();
        metadata.insert("monitor_type".to_string(), BACKEND.into());
        metadata.insert(
            "gpu_ids".to_string(),
            selected.iter().copied().collect::<Vec<u32>>().into(),
        );

        info!("Monitoring AMD GPUs {:?} (detected {:?})", selected, detected);
        Ok(Self {
            devices,
            selected,
            metadata,
        })
    }
}

#[async_trait]
impl PowerSource for AmdGpuSource {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn domain(&self) -> PowerDomain {
        PowerDomain::Gpu
    }

    fn semantics(&self) -> ReadSemantics {
        ReadSemantics::Instantaneous
    }

    async fn read(&mut self) -> Result<f64> {
        let reported = self
            .devices
            .iter()
            .filter(|(index, _)| self.selected.contains(index))
            .filter_map(|(index, dir)| {
                let watts = POWER_ATTRIBUTES
                    .iter()
                    .find_map(|attr| read_u64(&dir.join(attr)).ok())
                    .map(|microwatts| microwatts as f64 / 1e6);
                if watts.is_none() {
                    debug!("{}: GPU {} has no readable power attribute", BACKEND, index);
                }
                watts.map(|w| (*index, w))
            });

        sum_selected(BACKEND, reported, &self.selected)
    }

    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_hwmon() -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        let entries = [
            ("hwmon0", "k10temp", None),
            ("hwmon1", "amdgpu", Some(("power1_average", 120_000_000u64))),
            ("hwmon2", "amdgpu", Some(("power1_input", 80_000_000))),
        ];
        for (dir, name, power) in entries {
            let dir = root.path().join(dir);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("name"), format!("{}\n", name)).unwrap();
            if let Some((attr, value)) = power {
                fs::write(dir.join(attr), value.to_string()).unwrap();
            }
        }
        root
    }

    #[tokio::test]
    async fn test_sums_all_devices() {
        let root = fake_hwmon();
        let mut source = AmdGpuSource::new(AmdGpuConfig::default().with_hwmon_root(root.path())).unwrap();
        assert_eq!(source.read().await.unwrap(), 200.0);
    }

    #[tokio::test]
    async fn test_missing_device_contributes_zero() {
        let root = fake_hwmon();
        let config = AmdGpuConfig::default()
            .with_hwmon_root(root.path())
            .with_gpu_ids([1, 5]);
        let mut source = AmdGpuSource::new(config).unwrap();
        assert_eq!(source.read().await.unwrap(), 80.0);
    }

    #[test]
    fn test_no_amdgpu_fails() {
        let root = tempfile::tempdir().unwrap();
        let config = AmdGpuConfig::default().with_hwmon_root(root.path());
        assert!(AmdGpuSource::new(config).unwrap_err().is_unavailable());
    }
}
