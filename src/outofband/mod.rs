//! Out-of-band BMC telemetry.
//!
//! Cluster BMCs push their power and temperature metrics into a database
//! that is only reachable through an SSH jump host. The tunnel and SQL
//! driver live behind the [`PowerDatabase`] trait; [`OutOfBandClient`]
//! adds session handling, parameter validation and deadlines on top.

pub mod client;
pub mod config;

pub use client::{ClusterSummary, NodeSummary, OutOfBandClient};
pub use config::{DatabaseConfig, OutOfBandConfig, SshConfig};

use crate::error::{PowerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Metric tables the client knows how to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricTable {
    ComputePower,
    BoardTemperature,
}

impl MetricTable {
    pub fn table_name(&self) -> &'static str {
        match self {
            MetricTable::ComputePower => "computepower",
            MetricTable::BoardTemperature => "boardtemperature",
        }
    }
}

impl fmt::Display for MetricTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

/// One metric row as stored by the BMC collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    /// Watts for power tables, degrees Celsius for temperature tables
    pub value: f64,
    /// Sensor identifier within the node, when the table has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor: Option<String>,
}

/// Caller-facing query parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryParams {
    pub node_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            node_id: None,
            start_time: None,
            end_time: None,
            limit: 100,
        }
    }
}

impl QueryParams {
    pub fn for_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self.end_time = Some(end);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Validate the parameters and pick the query shape.
    pub fn shape(&self) -> Result<QueryShape> {
        if self.limit == 0 {
            return Err(PowerError::InvalidQuery("limit must be positive".to_string()));
        }

        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) if start > end => Err(PowerError::InvalidQuery(format!(
                "start {} is after end {}",
                start.to_rfc3339(),
                end.to_rfc3339()
            ))),
            (Some(start), Some(end)) => Ok(QueryShape::TimeRange {
                start,
                end,
                limit: self.limit,
            }),
            _ => Ok(QueryShape::Latest { limit: self.limit }),
        }
    }

    /// Whether `row` satisfies the node filter and whichever time bounds are set.
    pub fn matches(&self, row: &MetricRow) -> bool {
        self.node_id.as_ref().map_or(true, |node| *node == row.node_id)
            && self.start_time.map_or(true, |start| row.timestamp >= start)
            && self.end_time.map_or(true, |end| row.timestamp <= end)
    }
}

/// What the transport is asked to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryShape {
    /// Rows with `start <= timestamp <= end`, at most `limit` of them
    TimeRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    },
    /// The `limit` most recent rows
    Latest { limit: usize },
}

/// Tunnelled telemetry database.
///
/// Implementations own the SSH tunnel and the database session. They are
/// only ever driven by one [`OutOfBandClient`] at a time.
#[async_trait]
pub trait PowerDatabase: Send + Sync {
    /// Open the tunnel and the database session.
    async fn connect(&mut self, database: &DatabaseConfig, ssh: &SshConfig) -> Result<()>;

    /// Close the session and the tunnel. Must be safe to call when not connected.
    async fn disconnect(&mut self);

    /// Fetch rows of `table`, optionally restricted to one node.
    async fn query(
        &mut self,
        table: MetricTable,
        node_id: Option<&str>,
        shape: QueryShape,
    ) -> Result<Vec<MetricRow>>;

    /// Names of the metric tables present in the schema.
    async fn tables(&mut self) -> Result<Vec<String>>;
}
