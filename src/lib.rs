//! # Power Profiling - concurrent power capture for HPC runs
//!
//! Samples CPU, GPU and chassis power from heterogeneous backends at a fixed
//! interval, normalises every source into timestamped [`Reading`]s and lets an
//! orchestrator bracket a workload with `start()`/`stop()`.
//!
//! ## Features
//!
//! - **CPU**: Intel RAPL energy counters, AMD `k10temp`/`zenpower` hwmon
//! - **GPU**: `nvidia-smi`, NVML (feature `nvml`), AMD `amdgpu` hwmon
//! - **System**: IPMI DCMI, Redfish, iDRAC `racadm`
//! - **Out-of-band**: BMC telemetry queried from a tunnelled database
//! - **Statistics**: min, max, mean, median, energy over a capture
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use power_profiling::{Monitor, MonitorConfig, NvidiaSmiConfig, NvidiaSmiSource};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gpus = NvidiaSmiSource::new(NvidiaSmiConfig::default().with_gpu_ids([0, 1])).await?;
//!     let mut monitor = Monitor::new(gpus, MonitorConfig::new(100))?;
//!
//!     monitor.start().await;
//!     // run the benchmark here
//!     let readings = monitor.stop().await;
//!
//!     println!("{} readings, {:?}", readings.len(), monitor.statistics());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod metrics;
pub mod outofband;
pub mod sources;

// Re-export public API
pub use config::MonitorConfig;
pub use error::{PowerError, Result};
pub use metrics::{
    data::{CaptureRecord, Metadata, MonitorState, PowerDomain, Reading},
    integrator::CounterIntegrator,
    monitor::Monitor,
    statistics::PowerStatistics,
    traits::{PowerSource, ReadSemantics},
};
pub use outofband::{
    ClusterSummary, DatabaseConfig, MetricRow, MetricTable, NodeSummary, OutOfBandClient,
    OutOfBandConfig, PowerDatabase, QueryParams, QueryShape, SshConfig,
};
pub use sources::{
    AmdCpuConfig, AmdCpuSource, AmdGpuConfig, AmdGpuSource, IpmiConfig, IpmiRemote, IpmiSource,
    NvidiaSmiConfig, NvidiaSmiSource, RacadmConfig, RacadmSource, RaplConfig, RaplSource,
    RedfishConfig, RedfishSource,
};

#[cfg(feature = "nvml")]
pub use sources::{NvmlConfig, NvmlSource};

/// The default sampling interval in milliseconds
pub const DEFAULT_INTERVAL_MS: u64 = 100;

/// The default number of read attempts per tick
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// The default pause between failed read attempts in milliseconds
pub const DEFAULT_RETRY_DELAY_MS: u64 = 100;
