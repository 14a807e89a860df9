//! Submission gate with a soft, error-rate circuit breaker.
//!
//! Every task that passes through the gate reports back: a success heals
//! the error counter by one, a failure the predicate counts raises it by
//! one. While the counter is above the threshold the gate refuses new work,
//! but each refusal first waits `retry_delay` and then decays the counter
//! by one.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, info, warn};

use sluice_core::config::BreakerSettings;

use crate::error::{GateError, PoolError, WorkerError};
use crate::pool::WorkerPool;

/// Decides whether a task failure counts against the breaker.
pub type ErrorPredicate = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

/// Counts everything except a forced worker interruption.
pub fn default_error_predicate() -> ErrorPredicate {
    Arc::new(|err: &anyhow::Error| {
        !matches!(
            err.downcast_ref::<WorkerError>(),
            Some(WorkerError::Interrupted(_))
        )
    })
}

// ── CircuitBreaker ───────────────────────────────────────────────────

/// Shared error counter. Safe under concurrent increment and decrement.
pub struct CircuitBreaker {
    errors: AtomicUsize,
    threshold: usize,
    retry_delay: Duration,
    counts: ErrorPredicate,
}

impl CircuitBreaker {
    pub fn new(threshold: usize, retry_delay: Duration) -> Self {
        Self {
            errors: AtomicUsize::new(0),
            threshold,
            retry_delay,
            counts: default_error_predicate(),
        }
    }

    pub fn with_predicate(mut self, predicate: ErrorPredicate) -> Self {
        self.counts = predicate;
        self
    }

    pub fn error_count(&self) -> usize {
        self.errors.load(Ordering::SeqCst)
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Open means submissions are refused.
    pub fn is_open(&self) -> bool {
        self.error_count() > self.threshold
    }

    pub fn record_success(&self) {
        self.decrement();
    }

    /// Count `err` if the predicate says so. Returns whether it was counted.
    pub fn record_failure(&self, err: &anyhow::Error) -> bool {
        if !(self.counts)(err) {
            return false;
        }
        let now = self.errors.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(errors = now, threshold = self.threshold, error = %err, "failure counted");
        true
    }

    /// Zero the counter. Administrative escape hatch.
    pub fn reset(&self) {
        let before = self.errors.swap(0, Ordering::SeqCst);
        info!(errors = before, "circuit breaker reset");
    }

    fn decrement(&self) {
        let _ = self
            .errors
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

impl From<&BreakerSettings> for CircuitBreaker {
    fn from(s: &BreakerSettings) -> Self {
        Self::new(s.error_threshold, s.retry_delay())
    }
}

// ── SubmissionGate ───────────────────────────────────────────────────

/// Wraps a [`WorkerPool`]; gates submission behind a [`CircuitBreaker`].
pub struct SubmissionGate {
    pool: WorkerPool,
    breaker: Arc<CircuitBreaker>,
}

impl SubmissionGate {
    pub fn new(pool: WorkerPool, breaker: CircuitBreaker) -> Self {
        Self {
            pool,
            breaker: Arc::new(breaker),
        }
    }

    /// Shared handle to the breaker, for components that report failures
    /// of work they fan out themselves.
    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breaker.clone()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Submit a task.
    ///
    /// Fails with [`GateError::PoolClosed`] after shutdown and with
    /// [`GateError::CircuitOpen`] (after waiting the retry delay) while the
    /// breaker is open. A saturated pool surfaces as [`GateError::Saturated`].
    pub async fn submit<F>(&self, task: F) -> Result<(), GateError>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.pool.is_shutdown() {
            return Err(GateError::PoolClosed);
        }

        let errors = self.breaker.error_count();
        if errors > self.breaker.threshold {
            tokio::time::sleep(self.breaker.retry_delay).await;
            self.breaker.decrement();
            warn!(
                pool = %self.pool.name(),
                errors,
                threshold = self.breaker.threshold,
                "circuit open, submission refused"
            );
            return Err(GateError::CircuitOpen {
                errors,
                threshold: self.breaker.threshold,
            });
        }

        let breaker = self.breaker.clone();
        let wrapped = async move {
            match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => breaker.record_success(),
                Ok(Err(err)) => {
                    breaker.record_failure(&err);
                }
                Err(_) => {
                    breaker.record_failure(&anyhow::anyhow!("task panicked"));
                }
            }
        };

        self.pool.execute(wrapped).await.map_err(|e| match e {
            PoolError::Closed { .. } => GateError::PoolClosed,
            other => GateError::Saturated(other),
        })
    }

    /// Like [`submit`](Self::submit), but a saturated pool yields `Ok(false)`
    /// ("no slot") instead of an error.
    pub async fn try_submit<F>(&self, task: F) -> Result<bool, GateError>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        match self.submit(task).await {
            Ok(()) => Ok(true),
            Err(GateError::Saturated(e)) => {
                debug!(error = %e, "no slot");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Retry [`try_submit`](Self::try_submit) every `interval` until the task
    /// is accepted. May wait indefinitely; never use on a request path.
    ///
    /// A refused task is consumed by the attempt, so the caller supplies a
    /// factory. Only a closed pool ends the loop with an error.
    pub async fn try_submit_until_success<M, F>(
        &self,
        mut make_task: M,
        interval: Duration,
    ) -> Result<(), GateError>
    where
        M: FnMut() -> F,
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut attempts = 0u64;
        loop {
            attempts += 1;
            match self.try_submit(make_task()).await {
                Ok(true) => {
                    if attempts > 1 {
                        debug!(attempts, "submission accepted after retries");
                    }
                    return Ok(());
                }
                Ok(false) | Err(GateError::CircuitOpen { .. }) => {
                    tokio::time::sleep(interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn reset(&self) {
        self.breaker.reset();
    }

    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    pub fn shutdown_now(&self) -> usize {
        self.pool.shutdown_now()
    }

    pub async fn await_termination(&self, timeout: Duration) -> bool {
        self.pool.await_termination(timeout).await
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolBuilder;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;
    use tokio::sync::Semaphore;

    fn gate(threshold: usize, delay: Duration) -> SubmissionGate {
        let pool = PoolBuilder::new("gate")
            .core_size(1)
            .max_size(1)
            .queue_size(1)
            .build()
            .unwrap();
        SubmissionGate::new(pool, CircuitBreaker::new(threshold, delay))
    }

    async fn settle(gate: &SubmissionGate) {
        // Let queued wrappers run to completion on the single worker.
        for _ in 0..50 {
            if gate.pool().active_count() == 0 && gate.pool().queued() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    async fn fail(gate: &SubmissionGate, n: usize) {
        for _ in 0..n {
            gate.submit(async { Err(anyhow::anyhow!("sink down")) }).await.unwrap();
            settle(gate).await;
        }
    }

    #[tokio::test]
    async fn failures_raise_counter_successes_heal_it() {
        let gate = gate(5, Duration::from_millis(1));
        fail(&gate, 2).await;
        assert_eq!(gate.breaker().error_count(), 2);

        gate.submit(async { Ok(()) }).await.unwrap();
        settle(&gate).await;
        assert_eq!(gate.breaker().error_count(), 1);
    }

    #[tokio::test]
    async fn success_at_zero_stays_zero() {
        let gate = gate(5, Duration::from_millis(1));
        gate.submit(async { Ok(()) }).await.unwrap();
        settle(&gate).await;
        assert_eq!(gate.breaker().error_count(), 0);
    }

    #[tokio::test]
    async fn open_circuit_waits_decays_and_refuses() {
        let delay = Duration::from_millis(50);
        let gate = gate(2, delay);
        fail(&gate, 3).await;
        assert_eq!(gate.breaker().error_count(), 3);
        assert!(gate.breaker().is_open());

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let started = Instant::now();
        let result = gate
            .submit(async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(started.elapsed() >= delay);
        assert!(matches!(result, Err(GateError::CircuitOpen { errors: 3, threshold: 2 })));
        assert_eq!(gate.breaker().error_count(), 2);
        settle(&gate).await;
        assert!(!ran.load(Ordering::SeqCst), "refused task must not run");

        // Counter is back at the threshold: the gate admits again and
        // successes walk it down to zero.
        for _ in 0..2 {
            gate.submit(async { Ok(()) }).await.unwrap();
            settle(&gate).await;
        }
        assert_eq!(gate.breaker().error_count(), 0);
        assert!(gate.submit(async { Ok(()) }).await.is_ok());
    }

    #[tokio::test]
    async fn predicate_filters_counted_failures() {
        let pool = PoolBuilder::new("pred").build().unwrap();
        let breaker = CircuitBreaker::new(5, Duration::from_millis(1)).with_predicate(Arc::new(
            |err: &anyhow::Error| err.to_string().contains("timeout"),
        ));
        let gate = SubmissionGate::new(pool, breaker);

        gate.submit(async { Err(anyhow::anyhow!("bad row")) }).await.unwrap();
        settle(&gate).await;
        gate.submit(async { Err(anyhow::anyhow!("write timeout")) }).await.unwrap();
        settle(&gate).await;

        assert_eq!(gate.breaker().error_count(), 1);
    }

    #[tokio::test]
    async fn interruption_is_not_counted_by_default() {
        let breaker = CircuitBreaker::new(5, Duration::from_millis(1));
        assert!(!breaker.record_failure(&WorkerError::Interrupted("w".into()).into()));
        assert!(breaker.record_failure(&anyhow::anyhow!("real failure")));
        assert_eq!(breaker.error_count(), 1);
    }

    #[tokio::test]
    async fn panicking_task_counts_as_failure() {
        let gate = gate(5, Duration::from_millis(1));
        gate.submit(async {
            if true {
                panic!("boom");
            }
            Ok(())
        })
        .await
        .unwrap();
        settle(&gate).await;
        assert_eq!(gate.breaker().error_count(), 1);
    }

    #[tokio::test]
    async fn try_submit_reports_no_slot() {
        let hold = Arc::new(Semaphore::new(0));
        let gate = gate(5, Duration::from_millis(1));

        for _ in 0..2 {
            let hold = hold.clone();
            assert!(gate
                .try_submit(async move {
                    let _ = hold.acquire().await;
                    Ok(())
                })
                .await
                .unwrap());
        }
        assert!(!gate.try_submit(async { Ok(()) }).await.unwrap());
        hold.add_permits(10);
    }

    #[tokio::test]
    async fn try_submit_until_success_waits_for_slot() {
        let hold = Arc::new(Semaphore::new(0));
        let gate = Arc::new(gate(5, Duration::from_millis(1)));

        for _ in 0..2 {
            let hold = hold.clone();
            gate.submit(async move {
                let _ = hold.acquire().await;
                Ok(())
            })
            .await
            .unwrap();
        }

        let release = hold.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            release.add_permits(10);
        });

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            gate.try_submit_until_success(|| async { Ok(()) }, Duration::from_millis(5)),
        )
        .await
        .expect("should be admitted once the pool drains");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn closed_pool_fails_fast() {
        let gate = gate(5, Duration::from_millis(1));
        gate.shutdown();
        assert!(matches!(gate.submit(async { Ok(()) }).await, Err(GateError::PoolClosed)));
        assert!(matches!(gate.try_submit(async { Ok(()) }).await, Err(GateError::PoolClosed)));
        let until = gate
            .try_submit_until_success(|| async { Ok(()) }, Duration::from_millis(1))
            .await;
        assert!(matches!(until, Err(GateError::PoolClosed)));
    }

    #[tokio::test]
    async fn reset_zeroes_counter() {
        let gate = gate(0, Duration::from_millis(1));
        fail(&gate, 1).await;
        assert!(gate.breaker().is_open());
        gate.reset();
        assert_eq!(gate.breaker().error_count(), 0);
        assert!(gate.submit(async { Ok(()) }).await.is_ok());
    }
}
