//! Traits for power sources.

use crate::error::Result;
use crate::metrics::data::{Metadata, PowerDomain};
use async_trait::async_trait;
use std::time::Duration;

/// What the value returned by [`PowerSource::read`] means.
///
/// Declared by each backend rather than inferred, so a monitor knows whether
/// to differentiate the value or record it as is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReadSemantics {
    /// `read` returns power in watts.
    Instantaneous,
    /// `read` returns a monotonically increasing energy counter in joules.
    CumulativeEnergy {
        /// Value at which the hardware counter wraps back to zero, in joules
        max_range_joules: Option<f64>,
    },
}

impl ReadSemantics {
    pub fn is_cumulative(&self) -> bool {
        matches!(self, ReadSemantics::CumulativeEnergy { .. })
    }
}

/// A single hardware or remote power backend.
///
/// Implementations supply one raw read and the metadata to attach to each
/// reading; sampling, retries and counter integration live in
/// [`Monitor`](crate::Monitor). Interface probing happens in each
/// implementation's constructor, which must fail when the interface is absent.
#[async_trait]
pub trait PowerSource: Send + Sync + 'static {
    /// Short backend identifier, e.g. `"intel_rapl"`.
    fn name(&self) -> &'static str;

    /// Hardware domain this source measures.
    fn domain(&self) -> PowerDomain;

    /// Meaning of the value returned by [`read`](Self::read).
    fn semantics(&self) -> ReadSemantics;

    /// Take one raw sample: watts or cumulative joules depending on
    /// [`semantics`](Self::semantics).
    async fn read(&mut self) -> Result<f64>;

    /// Metadata attached to every reading from this source.
    fn metadata(&self) -> Metadata;

    /// Longest a single [`read`](Self::read) may take. Sources that shell out
    /// or go over the network return their deadline; `None` means reads
    /// return promptly, as sysfs attributes do.
    fn read_timeout(&self) -> Option<Duration> {
        None
    }

    /// Open any handle the source needs before the first sample of a run.
    async fn acquire(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release handles opened by [`acquire`](Self::acquire). Called on every
    /// exit path of the sampling task.
    async fn release(&mut self) {}
}
