//! Crate-wide error type for the data plane.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced across the pool, splitter, shard router, load
/// balancer, cache, and monitor. Transient failures are retried
/// internally before ever reaching this type (see the splitter and
/// load balancer retry loops); what surfaces here is either a
/// persistent failure or a condition the caller must act on.
#[derive(Error, Debug)]
pub enum Error {
    #[error("operation timed out after {0}ms")]
    Timeout(u64),

    #[error("no healthy endpoint available for role {role}: {reason}")]
    EndpointUnavailable { role: String, reason: String },

    #[error("shard key column '{column}' not found in query and cross-shard routing is disabled")]
    NoShardKey { column: String },

    #[error("routing topology changed mid-request, retry: {0}")]
    RoutingInconsistent(String),

    #[error("connection invalid after retry exhaustion: {0}")]
    ConnectionInvalid(String),

    #[error("cache refused entry: {0}")]
    CacheRefused(String),

    #[error("shard migration {migration_id} failed: {reason}")]
    MigrationFailed { migration_id: String, reason: String },

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("pool shut down")]
    ShuttingDown,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("other: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Errors the caller can safely retry (idempotent operations only).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::RoutingInconsistent(_) | Error::ConnectionInvalid(_)
        )
    }

    /// Errors that indicate a broken setup rather than a transient fault.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ConfigInvalid(_))
    }

    /// Structured errors never fail the caller's request in the cache or
    /// monitor paths; this marks the subset a caller may choose to ignore
    /// and continue without the optimization.
    pub fn is_advisory_only(&self) -> bool {
        matches!(self, Error::CacheRefused(_))
    }
}
