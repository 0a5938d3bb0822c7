//! Post-hoc summaries over a closed set of readings.

use crate::metrics::data::Reading;
use serde::{Deserialize, Serialize};

/// Summary statistics for a reading sequence.
///
/// Sequences with fewer than two readings produce all-zero statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerStatistics {
    pub min_watts: f64,
    pub max_watts: f64,
    pub mean_watts: f64,
    pub median_watts: f64,
    /// Population standard deviation
    pub std_dev_watts: f64,
    /// Mean power times duration
    pub total_energy_joules: f64,
    /// Span between the first and last reading
    pub duration_seconds: f64,
    pub sample_count: usize,
}

impl PowerStatistics {
    /// Summarise `readings`, which must be in recording order.
    pub fn from_readings(readings: &[Reading]) -> Self {
        let (first, last) = match (readings.first(), readings.last()) {
            (Some(first), Some(last)) if readings.len() >= 2 => (first, last),
            _ => return Self::default(),
        };

        let mut powers: Vec<f64> = readings.iter().map(Reading::power_watts).collect();
        let count = powers.len() as f64;

        let mean = powers.iter().sum::<f64>() / count;
        let variance = powers.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / count;

        powers.sort_by(f64::total_cmp);
        let min = powers[0];
        let max = powers[powers.len() - 1];
        let mid = powers.len() / 2;
        let median = if powers.len() % 2 == 0 {
            (powers[mid - 1] + powers[mid]) / 2.0
        } else {
            powers[mid]
        };

        let duration = (last.timestamp() - first.timestamp())
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        Self {
            min_watts: min,
            max_watts: max,
            mean_watts: mean,
            median_watts: median,
            std_dev_watts: variance.sqrt(),
            total_energy_joules: mean * duration,
            duration_seconds: duration,
            sample_count: readings.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }
}
