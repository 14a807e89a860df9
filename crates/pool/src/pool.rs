//! Worker pool factory.
//!
//! A [`WorkerPool`] runs boxed futures on a bounded set of named tokio
//! worker tasks. Admission follows the classic bounded-executor order:
//!
//! 1. fewer than `core_size` workers: start a worker with the task
//! 2. otherwise queue the task if the queue has room
//! 3. otherwise start an extra worker, up to `max_size`
//! 4. otherwise apply the [`RejectionPolicy`]
//!
//! Workers above `core_size` retire after `keep_alive` of idleness.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn, Instrument};

use sluice_core::config::PoolSettings;

use crate::error::PoolError;

/// A unit of work. Carries no identity beyond its future.
pub type Task = BoxFuture<'static, ()>;

/// What happens to a task that finds every worker busy and the queue full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionPolicy {
    /// Fail the submission with [`PoolError::Rejected`].
    #[default]
    Abort,
    /// Run the task inline on the submitting future.
    CallerRuns,
    /// Drop the task.
    Discard,
}

// ── Config ───────────────────────────────────────────────────────────

/// Immutable pool shape. Use [`PoolBuilder`] for fluent construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Worker names are `{name_prefix}-{n}`, `n` counting up from 1.
    pub name_prefix: String,
    pub core_size: usize,
    pub max_size: usize,
    /// Queue capacity; 0 = unbounded.
    pub queue_size: usize,
    pub keep_alive: Duration,
    /// Daemon pools abort their workers when the pool is dropped instead of
    /// letting them drain the queue.
    pub daemon: bool,
    pub rejection_policy: RejectionPolicy,
}

impl PoolConfig {
    pub fn new(name_prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: name_prefix.into(),
            core_size: 1,
            max_size: 1,
            queue_size: 0,
            keep_alive: Duration::from_secs(60),
            daemon: true,
            rejection_policy: RejectionPolicy::Abort,
        }
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(s: &PoolSettings) -> Self {
        Self {
            name_prefix: s.thread_prefix.clone(),
            core_size: s.core_size,
            max_size: s.max_size,
            queue_size: s.queue_size,
            keep_alive: s.keep_alive(),
            daemon: s.daemon,
            rejection_policy: RejectionPolicy::Abort,
        }
    }
}

/// Fluent builder for a [`WorkerPool`].
///
/// # Example
/// ```ignore
/// let pool = PoolBuilder::new("chunk")
///     .core_size(4)
///     .max_size(4)
///     .queue_size(8)
///     .rejection_policy(RejectionPolicy::CallerRuns)
///     .build()?;
/// ```
pub struct PoolBuilder {
    config: PoolConfig,
}

impl PoolBuilder {
    pub fn new(name_prefix: impl Into<String>) -> Self {
        Self {
            config: PoolConfig::new(name_prefix),
        }
    }

    pub fn core_size(mut self, n: usize) -> Self {
        self.config.core_size = n;
        self
    }

    pub fn max_size(mut self, n: usize) -> Self {
        self.config.max_size = n;
        self
    }

    /// Queue capacity (0 = unbounded).
    pub fn queue_size(mut self, n: usize) -> Self {
        self.config.queue_size = n;
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.config.keep_alive = keep_alive;
        self
    }

    pub fn daemon(mut self, daemon: bool) -> Self {
        self.config.daemon = daemon;
        self
    }

    pub fn rejection_policy(mut self, policy: RejectionPolicy) -> Self {
        self.config.rejection_policy = policy;
        self
    }

    pub fn build(self) -> Result<WorkerPool, PoolError> {
        WorkerPool::build(self.config)
    }
}

// ── Shared state ─────────────────────────────────────────────────────

struct WorkerSlot {
    name: String,
    abort: AbortHandle,
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Task>,
    workers: HashMap<u64, WorkerSlot>,
    active: usize,
    closed: bool,
    next_worker: u64,
}

struct Shared {
    config: PoolConfig,
    state: Mutex<PoolState>,
    work_ready: Notify,
    terminated: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn queue_has_room(&self, state: &PoolState) -> bool {
        self.config.queue_size == 0 || state.queue.len() < self.config.queue_size
    }

    /// Start a worker. Called with the state lock held so the worker count
    /// checked by the caller cannot change underneath it.
    fn spawn_worker(self: &Arc<Self>, state: &mut PoolState, first: Option<Task>) {
        state.next_worker += 1;
        let id = state.next_worker;
        let name = format!("{}-{}", self.config.name_prefix, id);
        let span = tracing::info_span!("pool_worker", worker = %name);
        let exit = WorkerExit {
            shared: self.clone(),
            id,
        };
        let handle = tokio::spawn(self.clone().run_worker(exit, first).instrument(span));
        state.workers.insert(
            id,
            WorkerSlot {
                name,
                abort: handle.abort_handle(),
            },
        );
    }

    /// `exit` is owned by the future, so the worker is deregistered even
    /// when it is aborted before its first poll.
    async fn run_worker(self: Arc<Self>, exit: WorkerExit, mut next: Option<Task>) {
        let id = exit.id;
        debug!("worker started");
        loop {
            let task = match next.take() {
                Some(task) => task,
                None => match self.next_task(id).await {
                    Some(task) => task,
                    None => break,
                },
            };
            self.run_task(task).await;
        }
        debug!("worker retired");
    }

    async fn run_task(&self, task: Task) {
        self.lock().active += 1;
        let _active = ActiveGuard { shared: self };
        if AssertUnwindSafe(task).catch_unwind().await.is_err() {
            error!(pool = %self.config.name_prefix, "task panicked");
        }
    }

    /// Wait for the next queued task. `None` means this worker should exit,
    /// either because the pool closed or because it idled past `keep_alive`
    /// while above `core_size` (in which case it is already deregistered).
    async fn next_task(&self, id: u64) -> Option<Task> {
        loop {
            let notified = self.work_ready.notified();
            tokio::pin!(notified);
            let may_retire = {
                let mut state = self.lock();
                if let Some(task) = state.queue.pop_front() {
                    return Some(task);
                }
                if state.closed {
                    return None;
                }
                notified.as_mut().enable();
                state.workers.len() > self.config.core_size
            };

            if !may_retire {
                notified.await;
                continue;
            }
            if tokio::time::timeout(self.config.keep_alive, notified).await.is_err() {
                let mut state = self.lock();
                if state.queue.is_empty() && state.workers.len() > self.config.core_size {
                    state.workers.remove(&id);
                    return None;
                }
            }
        }
    }
}

/// Deregisters a worker however its task ends, including abort.
struct WorkerExit {
    shared: Arc<Shared>,
    id: u64,
}

impl Drop for WorkerExit {
    fn drop(&mut self) {
        let drained = {
            let mut state = self.shared.lock();
            state.workers.remove(&self.id);
            state.closed && state.workers.is_empty()
        };
        if drained {
            self.shared.terminated.notify_waiters();
        }
    }
}

struct ActiveGuard<'a> {
    shared: &'a Shared,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.active = state.active.saturating_sub(1);
    }
}

// ── WorkerPool ───────────────────────────────────────────────────────

/// Bounded pool of named worker tasks.
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    /// Validate `config` and build an empty pool. Workers start lazily.
    ///
    /// A `max_size` below `core_size` is raised to `core_size` rather than
    /// refused.
    pub fn build(mut config: PoolConfig) -> Result<Self, PoolError> {
        if config.name_prefix.is_empty() {
            return Err(PoolError::InvalidConfig("name prefix must not be empty".into()));
        }
        if config.max_size < config.core_size {
            debug!(
                pool = %config.name_prefix,
                core = config.core_size,
                max = config.max_size,
                "max_size below core_size, raising"
            );
            config.max_size = config.core_size;
        }
        if config.max_size == 0 {
            return Err(PoolError::InvalidConfig(format!(
                "pool '{}' needs at least one worker",
                config.name_prefix
            )));
        }

        info!(
            pool = %config.name_prefix,
            core = config.core_size,
            max = config.max_size,
            queue = config.queue_size,
            daemon = config.daemon,
            policy = ?config.rejection_policy,
            "worker pool built"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(PoolState::default()),
                work_ready: Notify::new(),
                terminated: Notify::new(),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name_prefix
    }

    /// Submit a task.
    ///
    /// Never waits for capacity: a saturated pool resolves immediately
    /// according to its rejection policy. Only `CallerRuns` makes this
    /// future run the task itself.
    pub async fn execute<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task: Task = Box::pin(task);
        let cfg = &self.shared.config;

        let rejected = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(PoolError::Closed {
                    pool: cfg.name_prefix.clone(),
                });
            }
            if state.workers.len() < cfg.core_size {
                self.shared.spawn_worker(&mut state, Some(task));
                return Ok(());
            }
            if self.shared.queue_has_room(&state) {
                state.queue.push_back(task);
                if state.workers.is_empty() {
                    self.shared.spawn_worker(&mut state, None);
                }
                self.shared.work_ready.notify_one();
                return Ok(());
            }
            if state.workers.len() < cfg.max_size {
                self.shared.spawn_worker(&mut state, Some(task));
                return Ok(());
            }
            task
        };

        match cfg.rejection_policy {
            RejectionPolicy::Abort => {
                warn!(pool = %cfg.name_prefix, queue = cfg.queue_size, "pool saturated, task rejected");
                Err(PoolError::Rejected {
                    pool: cfg.name_prefix.clone(),
                })
            }
            RejectionPolicy::CallerRuns => {
                debug!(pool = %cfg.name_prefix, "pool saturated, running task on caller");
                if AssertUnwindSafe(rejected).catch_unwind().await.is_err() {
                    error!(pool = %cfg.name_prefix, "task panicked on caller");
                }
                Ok(())
            }
            RejectionPolicy::Discard => {
                debug!(pool = %cfg.name_prefix, "pool saturated, task discarded");
                Ok(())
            }
        }
    }

    /// Stop accepting tasks. Queued tasks still run; workers exit once the
    /// queue is empty.
    pub fn shutdown(&self) {
        let idle = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.workers.is_empty()
        };
        info!(pool = %self.name(), "pool shutting down");
        self.shared.work_ready.notify_waiters();
        if idle {
            self.shared.terminated.notify_waiters();
        }
    }

    /// Stop accepting tasks, drop everything still queued and abort running
    /// workers. Returns how many queued tasks were dropped.
    pub fn shutdown_now(&self) -> usize {
        let (dropped, handles) = {
            let mut state = self.shared.lock();
            state.closed = true;
            let dropped = std::mem::take(&mut state.queue);
            let handles: Vec<AbortHandle> =
                state.workers.values().map(|w| w.abort.clone()).collect();
            (dropped, handles)
        };
        warn!(
            pool = %self.name(),
            dropped = dropped.len(),
            running = handles.len(),
            "pool shut down immediately"
        );
        self.shared.work_ready.notify_waiters();
        for handle in handles {
            handle.abort();
        }
        dropped.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.lock().closed
    }

    /// Resolves once the pool is shut down and every worker has exited.
    pub async fn terminated(&self) {
        loop {
            let notified = self.shared.terminated.notified();
            tokio::pin!(notified);
            {
                let state = self.shared.lock();
                if state.closed && state.workers.is_empty() {
                    return;
                }
                notified.as_mut().enable();
            }
            notified.await;
        }
    }

    /// Wait up to `timeout` for termination; `true` if it happened in time.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.terminated()).await.is_ok()
    }

    /// Number of live workers.
    pub fn pool_size(&self) -> usize {
        self.shared.lock().workers.len()
    }

    /// Number of tasks currently running on workers.
    pub fn active_count(&self) -> usize {
        self.shared.lock().active
    }

    /// Number of tasks waiting in the queue.
    pub fn queued(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Names of live workers, oldest first.
    pub fn worker_names(&self) -> Vec<String> {
        let state = self.shared.lock();
        let mut ids: Vec<_> = state.workers.iter().map(|(id, w)| (*id, w.name.clone())).collect();
        ids.sort_by_key(|(id, _)| *id);
        ids.into_iter().map(|(_, name)| name).collect()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let handles: Vec<AbortHandle> = {
            let mut state = self.shared.lock();
            state.closed = true;
            if self.shared.config.daemon {
                state.workers.values().map(|w| w.abort.clone()).collect()
            } else {
                Vec::new()
            }
        };
        self.shared.work_ready.notify_waiters();
        for handle in handles {
            handle.abort();
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
