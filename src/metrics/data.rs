//! Data structures for power readings and capture records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::outofband::MetricRow;

/// Free-form metadata attached to each reading.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// One timestamped power sample.
///
/// Fields are private so a reading cannot change once it has been recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Wall-clock time the sample was taken (serialised as RFC 3339)
    timestamp: DateTime<Utc>,
    /// Power in watts
    power_watts: f64,
    /// Backend-specific context for the sample
    #[serde(default)]
    metadata: Metadata,
}

impl Reading {
    /// Create a reading stamped with the current wall-clock time.
    pub fn now(power_watts: f64, metadata: Metadata) -> Self {
        Self::at(Utc::now(), power_watts, metadata)
    }

    /// Create a reading with an explicit timestamp.
    pub fn at(timestamp: DateTime<Utc>, power_watts: f64, metadata: Metadata) -> Self {
        Self {
            timestamp,
            power_watts,
            metadata,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn power_watts(&self) -> f64 {
        self.power_watts
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Reading({}, {:.2}W)",
            self.timestamp.to_rfc3339(),
            self.power_watts
        )
    }
}

/// Hardware domain a monitor samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerDomain {
    Cpu,
    Gpu,
    System,
}

impl PowerDomain {
    /// Key used for this domain in a serialized capture record.
    pub fn record_key(&self) -> &'static str {
        match self {
            PowerDomain::Cpu => "cpu_power",
            PowerDomain::Gpu => "gpu_power",
            PowerDomain::System => "system_power",
        }
    }
}

impl fmt::Display for PowerDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PowerDomain::Cpu => "cpu",
            PowerDomain::Gpu => "gpu",
            PowerDomain::System => "system",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorState {
    Idle,
    Running,
}

/// All readings of one capture run, keyed by domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureRecord {
    /// Unique identifier for this run
    pub run_id: Uuid,
    /// When the first monitor was started
    pub started_at: DateTime<Utc>,
    /// When the last monitor was stopped
    pub finished_at: Option<DateTime<Utc>>,
    pub cpu_power: Vec<Reading>,
    pub gpu_power: Vec<Reading>,
    pub system_power: Vec<Reading>,
    /// Rows pulled from the out-of-band database, if any were requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_of_band: Option<Vec<MetricRow>>,
}

impl CaptureRecord {
    /// Create an empty record for a run starting now.
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            cpu_power: Vec::new(),
            gpu_power: Vec::new(),
            system_power: Vec::new(),
            out_of_band: None,
        }
    }

    /// Store the readings for one domain, replacing whatever was there.
    pub fn set_domain(&mut self, domain: PowerDomain, readings: Vec<Reading>) {
        match domain {
            PowerDomain::Cpu => self.cpu_power = readings,
            PowerDomain::Gpu => self.gpu_power = readings,
            PowerDomain::System => self.system_power = readings,
        }
    }

    pub fn domain(&self, domain: PowerDomain) -> &[Reading] {
        match domain {
            PowerDomain::Cpu => &self.cpu_power,
            PowerDomain::Gpu => &self.gpu_power,
            PowerDomain::System => &self.system_power,
        }
    }

    /// Mark the record as finished now.
    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}

impl Default for CaptureRecord {
    fn default() -> Self {
        Self::new()
    }
}
