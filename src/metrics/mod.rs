//! Power sampling and data structures.
//!
//! This module holds the sampling machinery shared by every backend: the
//! [`Reading`] value type, the [`PowerSource`] trait backends implement, the
//! counter integrator for cumulative energy interfaces, the background
//! [`Monitor`] and post-hoc statistics.

pub mod data;
pub mod integrator;
pub mod monitor;
pub mod statistics;
pub mod traits;

// Re-export commonly used items
pub use data::{CaptureRecord, Metadata, MonitorState, PowerDomain, Reading};
pub use integrator::CounterIntegrator;
pub use monitor::{Monitor, ReadingLog};
pub use statistics::PowerStatistics;
pub use traits::{PowerSource, ReadSemantics};
