//! Error handling for the power profiling crate.

/// A specialized `Result` type for power profiling operations.
pub type Result<T> = std::result::Result<T, PowerError>;

/// The main error type for power sampling and out-of-band queries.
#[derive(Debug, thiserror::Error)]
pub enum PowerError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A backend response or sysfs value could not be parsed
    #[error("Failed to parse power data: {0}")]
    ParseError(String),

    /// The backend's interface (path, executable, library or credentials) is missing
    #[error("{backend} is unavailable: {reason}")]
    Unavailable {
        backend: &'static str,
        reason: String,
    },

    /// A single read from a backend failed
    #[error("Read from {backend} failed: {reason}")]
    Read {
        backend: &'static str,
        reason: String,
    },

    /// Two counter samples did not produce a usable power value
    #[error("Counter integration rejected: {0}")]
    Integration(String),

    /// Out-of-band query issued without an open session
    #[error("Out-of-band client is not connected")]
    NotConnected,

    /// An operation did not finish within its deadline
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    /// Out-of-band query parameters are inconsistent
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// The out-of-band transport reported a failure
    #[error("Query failed: {0}")]
    Query(String),

    /// HTTP transport failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON decoding failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// NVML call failed (only available with nvml feature)
    #[cfg(feature = "nvml")]
    #[error("NVML error: {0}")]
    Nvml(#[from] nvml_wrapper::error::NvmlError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl PowerError {
    /// Create a new parse error
    pub fn parse_error(msg: impl Into<String>) -> Self {
        Self::ParseError(msg.into())
    }

    /// Create a new unavailable-backend error
    pub fn unavailable(backend: &'static str, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            backend,
            reason: reason.into(),
        }
    }

    /// Create a new read error
    pub fn read_error(backend: &'static str, reason: impl Into<String>) -> Self {
        Self::Read {
            backend,
            reason: reason.into(),
        }
    }

    /// Create a new integration error
    pub fn integration_error(msg: impl Into<String>) -> Self {
        Self::Integration(msg.into())
    }

    /// Create a new timeout error
    pub fn timeout(operation: &'static str, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation,
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Create a new query error
    pub fn query_error(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    /// Create a new configuration error
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error means the backend cannot be constructed on this host.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}
