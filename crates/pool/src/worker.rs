//! Managed worker lifecycle.
//!
//! A [`ManagedWorker`] is a long-running body plus an explicit lifecycle:
//! `Running -> ShuttingDown -> Terminated`. The body polls its
//! [`WorkerContext`] at safe points to honor a cooperative stop. The
//! [`WorkerControl`] handle drives shutdown from outside: graceful first,
//! then forced, which drops the body at its next await point (the way an
//! interrupt unblocks a thread stuck in a read).
//!
//! Termination fires exactly once and is observable by any number of
//! waiters, including when the body fails, panics, or never runs at all.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::WorkerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Running,
    ShuttingDown,
    Terminated,
}

/// How [`WorkerControl::shutdown`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Graceful,
    Forced,
}

struct Inner {
    name: String,
    state: watch::Sender<WorkerState>,
    interrupt: watch::Sender<bool>,
}

// ── WorkerControl ────────────────────────────────────────────────────

/// Cloneable shutdown handle for one managed worker.
#[derive(Clone)]
pub struct WorkerControl {
    inner: Arc<Inner>,
}

impl WorkerControl {
    fn new(name: String) -> Self {
        let (state, _) = watch::channel(WorkerState::Running);
        let (interrupt, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                name,
                state,
                interrupt,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> WorkerState {
        *self.inner.state.borrow()
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == WorkerState::Terminated
    }

    /// Ask the body to stop at its next safe point. Does not wait.
    pub fn start_graceful_shutdown(&self) {
        self.inner.state.send_if_modified(|s| {
            if *s == WorkerState::Running {
                *s = WorkerState::ShuttingDown;
                true
            } else {
                false
            }
        });
    }

    /// Wait up to `timeout` for termination; `true` if it happened in time.
    pub async fn await_shutdown(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.state.subscribe();
        let terminated = async move {
            rx.wait_for(|s| *s == WorkerState::Terminated).await.is_ok()
        };
        tokio::time::timeout(timeout, terminated).await.unwrap_or(false)
    }

    pub async fn graceful_shutdown(&self, timeout: Duration) -> bool {
        self.start_graceful_shutdown();
        self.await_shutdown(timeout).await
    }

    /// Flag shutdown and interrupt the body, for workers that do not poll
    /// the flag promptly.
    pub fn force_shutdown(&self) {
        self.start_graceful_shutdown();
        if !self.inner.interrupt.send_replace(true) {
            warn!(worker = %self.inner.name, "forcing worker shutdown");
        }
    }

    /// Graceful shutdown, escalating to forced if `timeout` passes. The only
    /// shutdown entry point external callers should use.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownOutcome {
        if self.graceful_shutdown(timeout).await {
            return ShutdownOutcome::Graceful;
        }
        warn!(worker = %self.inner.name, ?timeout, "graceful shutdown timed out");
        self.force_shutdown();
        if !self.await_shutdown(timeout).await {
            error!(worker = %self.inner.name, "worker still running after forced shutdown");
        }
        ShutdownOutcome::Forced
    }

    /// Mark terminated. Only the first call has an effect.
    fn terminate(&self) -> bool {
        self.inner.state.send_if_modified(|s| {
            if *s == WorkerState::Terminated {
                false
            } else {
                *s = WorkerState::Terminated;
                true
            }
        })
    }

    async fn interrupted(&self) {
        let mut rx = self.inner.interrupt.subscribe();
        let _ = rx.wait_for(|v| *v).await;
    }
}

impl std::fmt::Debug for WorkerControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerControl")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

// ── WorkerContext ────────────────────────────────────────────────────

/// The body's read-only view of its own lifecycle.
#[derive(Clone)]
pub struct WorkerContext {
    control: WorkerControl,
}

impl WorkerContext {
    pub fn name(&self) -> &str {
        self.control.name()
    }

    /// Poll at row/chunk boundaries; `true` means wind down now.
    pub fn is_shutting_down(&self) -> bool {
        self.control.state() != WorkerState::Running
    }

    /// Resolves once shutdown has been requested.
    pub async fn shutdown_requested(&self) {
        let mut rx = self.control.inner.state.subscribe();
        let _ = rx.wait_for(|s| *s != WorkerState::Running).await;
    }
}

// ── ManagedWorker ────────────────────────────────────────────────────

/// Fires termination when dropped, whether the body finished, failed,
/// panicked, or was never run.
struct TerminationGuard(WorkerControl);

impl Drop for TerminationGuard {
    fn drop(&mut self) {
        self.0.terminate();
    }
}

/// A long-running unit of work with a two-phase shutdown protocol.
pub struct ManagedWorker {
    control: WorkerControl,
    body: BoxFuture<'static, anyhow::Result<()>>,
    guard: TerminationGuard,
}

impl ManagedWorker {
    /// Build a worker. `body` receives the context it should poll.
    pub fn new<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(WorkerContext) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let control = WorkerControl::new(name.into());
        let ctx = WorkerContext {
            control: control.clone(),
        };
        Self {
            body: Box::pin(body(ctx)),
            guard: TerminationGuard(control.clone()),
            control,
        }
    }

    pub fn control(&self) -> WorkerControl {
        self.control.clone()
    }

    pub fn name(&self) -> &str {
        self.control.name()
    }

    /// Run the body to completion or interruption.
    ///
    /// Errors are logged and returned so the submitting gate can count
    /// them; termination fires before this future resolves.
    pub async fn run(self) -> anyhow::Result<()> {
        let ManagedWorker {
            control,
            body,
            guard,
        } = self;

        let result = tokio::select! {
            biased;
            _ = control.interrupted() => Err(WorkerError::Interrupted(control.name().to_string()).into()),
            r = body => r,
        };

        match &result {
            Ok(()) => info!(worker = %control.name(), "worker finished"),
            Err(e) if e.downcast_ref::<WorkerError>().is_some() => {
                warn!(worker = %control.name(), "worker interrupted");
            }
            Err(e) => error!(worker = %control.name(), error = %e, "worker failed"),
        }

        drop(guard);
        result
    }
}

// ── Tests ────────────────────────────────────────────────────────────
