//! Pool, gate and worker error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    /// Every worker is busy and the queue is full.
    #[error("pool '{pool}' saturated: task rejected")]
    Rejected { pool: String },

    #[error("pool '{pool}' is shut down")]
    Closed { pool: String },

    #[error("invalid pool config: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("pool is shut down")]
    PoolClosed,

    #[error("circuit open: {errors} errors exceed threshold {threshold}")]
    CircuitOpen { errors: usize, threshold: usize },

    #[error("pool saturated: {0}")]
    Saturated(PoolError),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker was stopped by `force_shutdown` before its body returned.
    #[error("worker '{0}' interrupted by forced shutdown")]
    Interrupted(String),
}
