//! Connection settings for the out-of-band telemetry database.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Telemetry database reached through the SSH tunnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    /// libpq-style `sslmode`
    pub ssl_mode: String,
    /// Schema holding the BMC metric tables
    pub schema: String,
}

impl DatabaseConfig {
    pub fn new(
        host: impl Into<String>,
        database: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: 5432,
            database: database.into(),
            username: username.into(),
            password: password.into(),
            ssl_mode: "prefer".to_string(),
            schema: "idrac".to_string(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_ssl_mode(mut self, ssl_mode: impl Into<String>) -> Self {
        self.ssl_mode = ssl_mode.into();
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }
}

/// Jump host used to tunnel to the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub private_key_path: PathBuf,
    #[serde(default)]
    pub passphrase: String,
    /// Seconds between keepalive packets
    pub keepalive_interval: u64,
}

impl SshConfig {
    pub fn new(
        hostname: impl Into<String>,
        username: impl Into<String>,
        private_key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            port: 22,
            username: username.into(),
            private_key_path: private_key_path.into(),
            passphrase: String::new(),
            keepalive_interval: 60,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = passphrase.into();
        self
    }
}

/// Everything [`OutOfBandClient`](super::OutOfBandClient) needs besides the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutOfBandConfig {
    pub database: DatabaseConfig,
    pub ssh: SshConfig,
    /// Deadline for establishing the tunnel and database session
    pub connect_timeout_ms: u64,
    /// Deadline for a single query
    pub query_timeout_ms: u64,
    /// How many recent rows [`summary_node`](super::OutOfBandClient::summary_node) looks at
    pub summary_limit: usize,
}

impl OutOfBandConfig {
    pub fn new(database: DatabaseConfig, ssh: SshConfig) -> Self {
        Self {
            database,
            ssh,
            connect_timeout_ms: 30_000,
            query_timeout_ms: 60_000,
            summary_limit: 1_000,
        }
    }

    pub fn with_connect_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = timeout_ms;
        self
    }

    pub fn with_query_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.query_timeout_ms = timeout_ms;
        self
    }

    pub fn with_summary_limit(mut self, limit: usize) -> Self {
        self.summary_limit = limit;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}
