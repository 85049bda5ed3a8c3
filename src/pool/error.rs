//! Error types for pool construction and connection acquisition

use std::time::Duration;

/// Error type returned by backend collaborators (`open` / `revalidate`)
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Invalid pool configuration. Fatal at construction, never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("pool capacity must be greater than zero")]
    ZeroCapacity,

    #[error("initial connections ({initial}) exceed pool capacity ({capacity})")]
    InitialExceedsCapacity { initial: usize, capacity: usize },

    #[error("backend host must not be empty")]
    EmptyHost,

    #[error("backend port must not be zero")]
    ZeroPort,

    #[error("max_repair_attempts must be at least 1 (leave it unset to retry forever)")]
    ZeroRepairAttempts,
}

/// Error types for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Invalid pool configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to connect to backend {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: BoxError,
    },

    #[error("Pool is exhausted: no connection became available within {timeout:?}")]
    Exhausted { timeout: Duration },

    #[error("Pool is closed")]
    Closed,
}

impl PoolError {
    /// True when the pool was saturated and the caller may retry later
    pub fn is_exhausted(&self) -> bool {
        matches!(self, PoolError::Exhausted { .. })
    }

    /// True when the backend could not be reached
    pub fn is_connect(&self) -> bool {
        matches!(self, PoolError::Connect { .. })
    }
}
