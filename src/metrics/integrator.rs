//! Conversion of cumulative energy counters into average power.

use crate::error::{PowerError, Result};
use std::time::Instant;

/// Upper bound on a plausible integrated power value in watts.
pub const DEFAULT_MAX_PLAUSIBLE_WATTS: f64 = 10_000.0;

/// One sample of a cumulative energy counter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CounterSample {
    /// Counter value in joules
    pub raw_joules: f64,
    pub captured_at: Instant,
}

/// Differentiates successive counter samples into watts.
///
/// Keeps exactly one previous sample. The first sample after construction or
/// [`reset`](Self::reset) only primes the integrator.
#[derive(Debug, Clone)]
pub struct CounterIntegrator {
    last: Option<CounterSample>,
    max_range_joules: Option<f64>,
    max_plausible_watts: f64,
}

impl CounterIntegrator {
    pub fn new(max_range_joules: Option<f64>) -> Self {
        Self {
            last: None,
            max_range_joules,
            max_plausible_watts: DEFAULT_MAX_PLAUSIBLE_WATTS,
        }
    }

    /// Set the largest power value accepted as real.
    pub fn with_max_plausible_watts(mut self, watts: f64) -> Self {
        self.max_plausible_watts = watts;
        self
    }

    /// Feed the next counter sample.
    ///
    /// Returns `Ok(None)` for the warm-up sample, `Ok(Some(watts))` otherwise.
    /// Errors mean this tick produced no usable value; the sample still
    /// replaces the previous one so the next tick can recover.
    pub fn integrate(&mut self, raw_joules: f64, captured_at: Instant) -> Result<Option<f64>> {
        let current = CounterSample {
            raw_joules,
            captured_at,
        };
        let previous = self.last.replace(current);

        match previous {
            Some(previous) => {
                compute_power(&previous, &current, self.max_range_joules, self.max_plausible_watts)
                    .map(Some)
            }
            None => Ok(None),
        }
    }

    /// Forget the previous sample.
    pub fn reset(&mut self) {
        self.last = None;
    }

    pub fn last_sample(&self) -> Option<&CounterSample> {
        self.last.as_ref()
    }

    pub fn max_range_joules(&self) -> Option<f64> {
        self.max_range_joules
    }
}

/// Average power between two counter samples, handling a single wraparound.
pub fn compute_power(
    previous: &CounterSample,
    current: &CounterSample,
    max_range_joules: Option<f64>,
    max_plausible_watts: f64,
) -> Result<f64> {
    let elapsed = current
        .captured_at
        .checked_duration_since(previous.captured_at)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    if elapsed <= 0.0 {
        return Err(PowerError::integration_error(
            "samples have no elapsed time between them",
        ));
    }

    let delta = if current.raw_joules >= previous.raw_joules {
        current.raw_joules - previous.raw_joules
    } else {
        match max_range_joules {
            Some(max) => max - previous.raw_joules + current.raw_joules,
            None => {
                return Err(PowerError::integration_error(format!(
                    "counter decreased from {} to {} with no known range",
                    previous.raw_joules, current.raw_joules
                )))
            }
        }
    };

    let watts = delta / elapsed;
    if !watts.is_finite() || watts < 0.0 {
        return Err(PowerError::integration_error(format!(
            "computed power {watts} W is not a valid value"
        )));
    }
    if watts > max_plausible_watts {
        return Err(PowerError::integration_error(format!(
            "computed power {watts:.1} W exceeds plausible limit {max_plausible_watts:.1} W"
        )));
    }

    Ok(watts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_sample_is_warm_up() {
        let mut integrator = CounterIntegrator::new(None);
        let result = integrator.integrate(100.0, Instant::now()).unwrap();
        assert!(result.is_none());
        assert!(integrator.last_sample().is_some());
    }

    #[test]
    fn test_increasing_counter() {
        let t0 = Instant::now();
        let mut integrator = CounterIntegrator::new(None);
        integrator.integrate(1_000.0, t0).unwrap();

        let watts = integrator
            .integrate(1_250.0, t0 + Duration::from_millis(2_500))
            .unwrap()
            .unwrap();
        assert!((watts - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_wraparound() {
        let max_range = 262_143.328_850;
        let t0 = Instant::now();
        let mut integrator = CounterIntegrator::new(Some(max_range));
        integrator.integrate(max_range - 100.0, t0).unwrap();

        let watts = integrator
            .integrate(50.0, t0 + Duration::from_secs(1))
            .unwrap()
            .unwrap();
        assert!((watts - 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_decrease_without_range_is_rejected() {
        let t0 = Instant::now();
        let mut integrator = CounterIntegrator::new(None);
        integrator.integrate(500.0, t0).unwrap();

        let result = integrator.integrate(10.0, t0 + Duration::from_secs(1));
        assert!(matches!(result, Err(PowerError::Integration(_))));

        // the rejected sample still becomes the new baseline
        let watts = integrator
            .integrate(30.0, t0 + Duration::from_secs(2))
            .unwrap()
            .unwrap();
        assert!((watts - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_implausible_value_is_rejected() {
        let t0 = Instant::now();
        let mut integrator = CounterIntegrator::new(Some(1_000_000.0)).with_max_plausible_watts(500.0);
        integrator.integrate(0.0, t0).unwrap();

        let result = integrator.integrate(900.0, t0 + Duration::from_secs(1));
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_elapsed_is_rejected() {
        let t0 = Instant::now();
        let mut integrator = CounterIntegrator::new(None);
        integrator.integrate(1.0, t0).unwrap();
        assert!(integrator.integrate(2.0, t0).is_err());
    }

    #[test]
    fn test_reset() {
        let t0 = Instant::now();
        let mut integrator = CounterIntegrator::new(None);
        integrator.integrate(1.0, t0).unwrap();
        integrator.reset();
        let result = integrator.integrate(2.0, t0 + Duration::from_secs(1)).unwrap();
        assert!(result.is_none());
    }
}
