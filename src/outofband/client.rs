//! Session handling and validated queries over a [`PowerDatabase`].

use super::{MetricRow, MetricTable, OutOfBandConfig, PowerDatabase, QueryParams};
use crate::error::{PowerError, Result};
use crate::metrics::data::{Metadata, Reading};
use crate::metrics::statistics::PowerStatistics;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Recent compute-power summary for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub node_id: String,
    /// Most recent row, if the node has any
    pub latest: Option<MetricRow>,
    pub statistics: PowerStatistics,
}

impl NodeSummary {
    fn from_rows(node_id: String, mut rows: Vec<MetricRow>) -> Self {
        rows.sort_by_key(|row| row.timestamp);
        let readings: Vec<Reading> = rows
            .iter()
            .map(|row| Reading::at(row.timestamp, row.value, Metadata::new()))
            .collect();

        Self {
            node_id,
            statistics: PowerStatistics::from_readings(&readings),
            latest: rows.pop(),
        }
    }
}

/// Recent compute-power summary across every node that reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummary {
    /// One entry per node, ordered by node id
    pub nodes: Vec<NodeSummary>,
    /// Sum of each node's latest reading
    pub total_latest_watts: f64,
}

impl ClusterSummary {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeSummary> {
        self.nodes.iter().find(|node| node.node_id == node_id)
    }
}

/// Request/response client for BMC telemetry stored off the node.
pub struct OutOfBandClient<D> {
    database: D,
    config: OutOfBandConfig,
    connected: bool,
}

impl<D: PowerDatabase> OutOfBandClient<D> {
    pub fn new(database: D, config: OutOfBandConfig) -> Self {
        Self {
            database,
            config,
            connected: false,
        }
    }

    pub fn config(&self) -> &OutOfBandConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Open the tunnel and database session. A no-op when already connected.
    pub async fn connect(&mut self) -> Result<()> {
        if self.connected {
            debug!("Out-of-band session already open");
            return Ok(());
        }

        let timeout = self.config.connect_timeout();
        let connecting = self.database.connect(&self.config.database, &self.config.ssh);
        match tokio::time::timeout(timeout, connecting).await {
            Ok(Ok(())) => {
                self.connected = true;
                info!(
                    "Connected to {}:{} via {}",
                    self.config.database.host, self.config.database.port, self.config.ssh.hostname
                );
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("Connecting to {} failed: {}", self.config.ssh.hostname, e);
                // a failed handshake can leave the tunnel up
                self.database.disconnect().await;
                Err(e)
            }
            Err(_) => {
                warn!("Connecting to {} timed out", self.config.ssh.hostname);
                // drop whatever half-open state the transport kept
                self.database.disconnect().await;
                Err(PowerError::timeout("out-of-band connect", timeout))
            }
        }
    }

    /// Close the session. Safe to call when not connected.
    pub async fn disconnect(&mut self) {
        if self.connected {
            self.database.disconnect().await;
            self.connected = false;
            debug!("Out-of-band session closed");
        }
    }

    /// Run `f` inside a session that is always closed afterwards.
    ///
    /// ```rust,ignore
    /// let rows = client
    ///     .with_session(|c| Box::pin(async move { c.fetch_compute_power(&params).await }))
    ///     .await?;
    /// ```
    pub async fn with_session<T, F>(&mut self, f: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut Self) -> BoxFuture<'a, Result<T>>,
    {
        self.connect().await?;
        let result = f(self).await;
        self.disconnect().await;
        result
    }

    /// Compute-power rows (watts) matching `params`.
    pub async fn fetch_compute_power(&mut self, params: &QueryParams) -> Result<Vec<MetricRow>> {
        self.query(MetricTable::ComputePower, params).await
    }

    /// Board-temperature rows (degrees Celsius) matching `params`.
    pub async fn fetch_board_temperature(
        &mut self,
        params: &QueryParams,
    ) -> Result<Vec<MetricRow>> {
        self.query(MetricTable::BoardTemperature, params).await
    }

    /// Summarise the most recent compute-power rows of one node.
    pub async fn summary_node(&mut self, node_id: &str) -> Result<NodeSummary> {
        let params = QueryParams::default()
            .for_node(node_id)
            .with_limit(self.config.summary_limit);
        let rows = self.fetch_compute_power(&params).await?;
        Ok(NodeSummary::from_rows(node_id.to_string(), rows))
    }

    /// Summarise the most recent compute-power rows of every node.
    ///
    /// `summary_limit` bounds the rows fetched for the whole cluster, so
    /// nodes with only older rows may be missing from the result.
    pub async fn summary_cluster(&mut self) -> Result<ClusterSummary> {
        let params = QueryParams::default().with_limit(self.config.summary_limit);
        let rows = self.fetch_compute_power(&params).await?;

        let mut by_node: BTreeMap<String, Vec<MetricRow>> = BTreeMap::new();
        for row in rows {
            by_node.entry(row.node_id.clone()).or_default().push(row);
        }

        let nodes: Vec<NodeSummary> = by_node
            .into_iter()
            .map(|(node_id, rows)| NodeSummary::from_rows(node_id, rows))
            .collect();
        let total_latest_watts = nodes
            .iter()
            .filter_map(|node| node.latest.as_ref())
            .map(|row| row.value)
            .sum();
        debug!("Cluster summary covers {} nodes", nodes.len());

        Ok(ClusterSummary {
            nodes,
            total_latest_watts,
        })
    }

    /// Metric tables present in the configured schema.
    pub async fn available_tables(&mut self) -> Result<Vec<String>> {
        self.ensure_connected()?;
        let timeout = self.config.query_timeout();
        tokio::time::timeout(timeout, self.database.tables())
            .await
            .map_err(|_| PowerError::timeout("out-of-band table listing", timeout))?
    }

    pub fn into_inner(self) -> D {
        self.database
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(PowerError::NotConnected)
        }
    }

    async fn query(&mut self, table: MetricTable, params: &QueryParams) -> Result<Vec<MetricRow>> {
        self.ensure_connected()?;
        let shape = params.shape()?;

        let timeout = self.config.query_timeout();
        let mut rows = tokio::time::timeout(
            timeout,
            self.database.query(table, params.node_id.as_deref(), shape),
        )
        .await
        .map_err(|_| PowerError::timeout("out-of-band query", timeout))??;

        // the transport is not trusted to honour the bounds
        let returned = rows.len();
        rows.retain(|row| params.matches(row));
        rows.truncate(params.limit);
        if rows.len() != returned {
            debug!(
                "{}: kept {} of {} returned rows",
                table,
                rows.len(),
                returned
            );
        }

        Ok(rows)
    }
}
