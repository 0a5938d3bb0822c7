//! NVIDIA GPU power through the NVIDIA Management Library.
//!
//! Only compiled with the `nvml` feature; needs `libnvidia-ml.so` at runtime.

use crate::error::{PowerError, Result};
use crate::metrics::data::{Metadata, PowerDomain};
use crate::metrics::traits::{PowerSource, ReadSemantics};
use async_trait::async_trait;
use nvml_wrapper::Nvml;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use super::{host_metadata, sum_selected};

const BACKEND: &str = "nvml";

/// Configuration for [`NvmlSource`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NvmlConfig {
    /// Device indices to sum; `None` selects every device
    pub gpu_ids: Option<Vec<u32>>,
}

impl NvmlConfig {
    pub fn with_gpu_ids(mut self, ids: impl IntoIterator<Item = u32>) -> Self {
        self.gpu_ids = Some(ids.into_iter().collect());
        self
    }
}

/// Sum of NVML `power_usage` across a set of GPUs.
///
/// The library handle is closed on [`release`](PowerSource::release) and
/// reopened on the next [`acquire`](PowerSource::acquire).
pub struct NvmlSource {
    nvml: Option<Nvml>,
    selected: BTreeSet<u32>,
    metadata: Metadata,
}

impl NvmlSource {
    pub fn new(config: NvmlConfig) -> Result<Self> {
        let nvml = Nvml::init()
            .map_err(|e| PowerError::unavailable(BACKEND, format!("NVML init failed: {}", e)))?;
        let count = nvml
            .device_count()
            .map_err(|e| PowerError::unavailable(BACKEND, format!("cannot count devices: {}", e)))?;
        if count == 0 {
            return Err(PowerError::unavailable(BACKEND, "no NVIDIA GPUs detected"));
        }

        let detected: BTreeSet<u32> = (0..count).collect();
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

        let mut gpu_info = serde_json::Map::new();
        for &index in selected.intersection(&detected) {
            match nvml.device_by_index(index).and_then(|device| device.name()) {
                Ok(name) => {
                    gpu_info.insert(format!("gpu_{}", index), json!({ "name": name }));
                }
                Err(e) => warn!("{}: cannot read name of GPU {}: {}", BACKEND, index, e),
            }
        }

        let mut metadata = host_metadata();
        metadata.insert("monitor_type".to_string(), BACKEND.into());
        metadata.insert(
            "gpu_ids".to_string(),
            selected.iter().copied().collect::<Vec<u32>>().into(),
        );
        metadata.insert("gpu_info".to_string(), gpu_info.into());
        if let Ok(driver) = nvml.sys_driver_version() {
            metadata.insert("driver".to_string(), driver.into());
        }

        info!("Monitoring NVIDIA GPUs {:?} through NVML", selected);
        Ok(Self {
            nvml: Some(nvml),
            selected,
            metadata,
        })
    }
}

#[async_trait]
impl PowerSource for NvmlSource {
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
        let nvml = self
            .nvml
            .as_ref()
            .ok_or_else(|| PowerError::read_error(BACKEND, "NVML handle is closed"))?;

        let reported = self.selected.iter().filter_map(|&index| {
            match nvml.device_by_index(index).and_then(|device| device.power_usage()) {
                Ok(milliwatts) => Some((index, milliwatts as f64 / 1000.0)),
                Err(e) => {
                    debug!("{}: GPU {} power query failed: {}", BACKEND, index, e);
                    None
                }
            }
        });

        sum_selected(BACKEND, reported, &self.selected)
    }

    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }

    async fn acquire(&mut self) -> Result<()> {
        if self.nvml.is_none() {
            self.nvml = Some(Nvml::init()?);
        }
        Ok(())
    }

    async fn release(&mut self) {
        // dropping the handle calls nvmlShutdown
        self.nvml = None;
    }
}
