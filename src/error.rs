//! Error taxonomy for intake, configuration and lifecycle control.

use crate::priority::Category;
use thiserror::Error;

/// Why an enqueue was refused. Recoverable by caller backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RejectReason {
    /// Lane at capacity and the overflow policy found nothing it may evict.
    #[error("lane is full and no lower-priority event can be evicted")]
    Full,
    /// Scheduler is draining or stopped.
    #[error("scheduler is not accepting events")]
    Closed,
    #[error("payload of {len} bytes exceeds the {max}-byte limit for this category")]
    PayloadTooLarge { len: usize, max: usize },
}

/// Invalid configuration values, reported at `configure()` / `start()` time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} = {value} is outside the accepted range {min}..={max}")]
    OutOfRange {
        field: String,
        value: u128,
        min: u128,
        max: u128,
    },

    #[error("{field} = {value} is outside the accepted range {min}..={max}")]
    OutOfRangeRatio {
        field: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("{field}: minimum {min} is greater than maximum {max}")]
    InvalidRange { field: String, min: u128, max: u128 },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle and registration failures of the scheduler core.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("operation requires the scheduler to be stopped (current state: {0})")]
    NotStopped(&'static str),

    #[error("a consumer is already registered for {0}; detach it first")]
    ConsumerConflict(Category),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}
