//! Bounded task execution: worker pools, the error-rate submission gate,
//! and the two-phase shutdown lifecycle for long-running workers.

pub mod error;
pub mod gate;
pub mod pool;
pub mod worker;

pub use error::{GateError, PoolError, WorkerError};
pub use gate::{CircuitBreaker, ErrorPredicate, SubmissionGate};
pub use pool::{PoolBuilder, PoolConfig, RejectionPolicy, Task, WorkerPool};
pub use worker::{ManagedWorker, ShutdownOutcome, WorkerContext, WorkerControl, WorkerState};
