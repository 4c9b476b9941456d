//! Pool error types.

use thiserror::Error;

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced by pool operations.
///
/// Guarded state-transition races are not errors: the transition primitive
/// returns `false` and the caller moves on to another connection.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool {alias} exhausted: {active} of {max} connections in use and none available")]
    CapacityExhausted {
        alias: String,
        active: usize,
        max: usize,
    },

    #[error("pool {alias} refused to build: {building} connections already being built (limit {limit})")]
    Throttled {
        alias: String,
        building: usize,
        limit: usize,
    },

    #[error("pool {alias} failed to build a connection: {message}")]
    Build { alias: String, message: String },

    #[error("pool {alias} destroyed connection #{id} after fatal error: {message}")]
    Fatal {
        alias: String,
        id: u64,
        message: String,
    },

    #[error("pool {alias} connection #{id} failed: {message}")]
    Execute {
        alias: String,
        id: u64,
        message: String,
    },

    #[error("pool {alias} connection #{id} is closed")]
    Closed { alias: String, id: u64 },

    #[error("pool {0} is shutting down")]
    ShuttingDown(String),

    #[error("pool not found: {0}")]
    PoolNotFound(String),

    #[error("pool already registered: {0}")]
    AlreadyRegistered(String),

    #[error("pool {alias} has no connection #{id}")]
    ConnectionNotFound { alias: String, id: u64 },

    #[error("invalid pool definition: {0}")]
    InvalidDefinition(String),

    #[error("config error: {0}")]
    Config(String),
}

impl PoolError {
    /// Whether this is a recoverable refusal the caller may retry.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            PoolError::CapacityExhausted { .. } | PoolError::Throttled { .. }
        )
    }
}
