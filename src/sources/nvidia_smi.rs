//! NVIDIA GPU power via the `nvidia-smi` command-line query interface.
//!
//! `nvidia-smi --query-gpu=index,power.draw --format=csv,noheader` prints one
//! `index, watts` pair per device; the configured device set is summed.

use crate::error::{PowerError, Result};
use crate::metrics::data::{Metadata, PowerDomain};
use crate::metrics::traits::{PowerSource, ReadSemantics};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{host_metadata, run_command, sum_selected, DEFAULT_COMMAND_TIMEOUT_MS};

const BACKEND: &str = "nvidia_smi";

/// Configuration for [`NvidiaSmiSource`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NvidiaSmiConfig {
    /// Path or name of the `nvidia-smi` executable
    pub executable: PathBuf,
    /// Device indices to sum; `None` selects every detected GPU
    pub gpu_ids: Option<Vec<u32>>,
    /// Deadline for one invocation in milliseconds
    pub timeout_ms: u64,
}

impl Default for NvidiaSmiConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("nvidia-smi"),
            gpu_ids: None,
            timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
        }
    }
}

impl NvidiaSmiConfig {
    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = executable.into();
        self
    }

    pub fn with_gpu_ids(mut self, ids: impl IntoIterator<Item = u32>) -> Self {
        self.gpu_ids = Some(ids.into_iter().collect());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Sum of `power.draw` across a set of NVIDIA GPUs.
#[derive(Debug)]
pub struct NvidiaSmiSource {
    config: NvidiaSmiConfig,
    selected: BTreeSet<u32>,
    metadata: Metadata,
}

impl NvidiaSmiSource {
    /// Probe the executable, list the GPUs and resolve the device set.
    pub async fn new(config: NvidiaSmiConfig) -> Result<Self> {
        let listing = run_command(
            BACKEND,
            &config.executable,
            &query_args("index"),
            &[],
            config.timeout(),
        )
        .await
        .map_err(|e| PowerError::unavailable(BACKEND, e.to_string()))?;

        let detected = parse_indices(&listing)?;
        if detected.is_empty() {
            return Err(PowerError::unavailable(BACKEND, "no NVIDIA GPUs detected"));
        }

        let selected: BTreeSet<u32> = match &config.gpu_ids {
            Some(ids) => ids.iter().copied().collect(),
            None => detected.clone(),
        };
        if selected.is_disjoint(&detected) {
            return Err(PowerError::unavailable(
                BACKEND,
                format!("configured GPUs {:?} not present, detected {:?}", selected, detected),
            ));
        }

        let mut metadata = host_metadata();
        metadata.insert("monitor_type".to_string(), "nvidia_gpu".into());
        metadata.insert(
            "gpu_ids".to_string(),
            selected.iter().copied().collect::<Vec<u32>>().into(),
        );
        match run_command(
            BACKEND,
            &config.executable,
            &query_args("index,name,memory.total,driver_version"),
            &[],
            config.timeout(),
        )
        .await
        {
            Ok(output) => {
                metadata.insert("gpu_info".to_string(), parse_gpu_info(&output, &selected));
            }
            Err(e) => warn!("{}: could not query GPU details: {}", BACKEND, e),
        }

        info!("Monitoring NVIDIA GPUs {:?} (detected {:?})", selected, detected);
        Ok(Self {
            config,
            selected,
            metadata,
        })
    }

    pub fn selected_gpus(&self) -> &BTreeSet<u32> {
        &self.selected
    }
}

#[async_trait]
impl PowerSource for NvidiaSmiSource {
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
        let output = run_command(
            BACKEND,
            &self.config.executable,
            &query_args("index,power.draw"),
            &[],
            self.config.timeout(),
        )
        .await?;

        total_power_draw(&output, &self.selected)
    }

    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }

    fn read_timeout(&self) -> Option<Duration> {
        Some(self.config.timeout())
    }
}

fn query_args(fields: &str) -> Vec<String> {
    vec![
        format!("--query-gpu={}", fields),
        "--format=csv,noheader".to_string(),
    ]
}

/// Sum the `power.draw` of the selected devices in a query response.
///
/// Devices missing from the response, or reporting `[N/A]`, contribute zero.
pub fn total_power_draw(output: &str, selected: &BTreeSet<u32>) -> Result<f64> {
    let reported = parse_power_draw(output)?;
    sum_selected(BACKEND, reported, selected)
}

/// Parse `index, power.draw` lines. Devices without a numeric reading are left out.
pub fn parse_power_draw(output: &str) -> Result<Vec<(u32, f64)>> {
    let mut readings = Vec::new();

    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (index, power) = line
            .split_once(',')
            .ok_or_else(|| PowerError::parse_error(format!("unexpected nvidia-smi line {:?}", line)))?;
        let index = parse_index(index)?;

        let power = power.trim().trim_end_matches('W').trim();
        match power.parse::<f64>() {
            Ok(watts) => readings.push((index, watts)),
            Err(_) => debug!("{}: GPU {} reports no power draw ({})", BACKEND, index, power),
        }
    }

    Ok(readings)
}

fn parse_index(field: &str) -> Result<u32> {
    field
        .trim()
        .parse::<u32>()
        .map_err(|e| PowerError::parse_error(format!("bad GPU index {:?}: {}", field, e)))
}

fn parse_indices(output: &str) -> Result<BTreeSet<u32>> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(parse_index)
        .collect()
}

fn parse_gpu_info(output: &str, selected: &BTreeSet<u32>) -> serde_json::Value {
    let mut info = serde_json::Map::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let [index, name, memory, driver] = fields.as_slice() else {
            continue;
        };
        let Ok(index) = index.parse::<u32>() else {
            continue;
        };
        if selected.contains(&index) {
            info.insert(
                format!("gpu_{}", index),
                json!({ "name": name, "memory": memory, "driver": driver }),
            );
        }
    }
    serde_json::Value::Object(info)
}
