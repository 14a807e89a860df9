//! Import admission.
//!
//! [`ImportCoordinator::submit`] resolves a source, optionally provisions its
//! table and hands a streaming import worker to the submission gate. It
//! answers immediately: `true` means the job was accepted, not finished.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use sluice_core::config::{ChunkSettings, ImportSettings};
use sluice_pool::{CircuitBreaker, GateError, ShutdownOutcome, SubmissionGate, WorkerControl, WorkerState};
use sluice_storage::{BatchSink, FileStore};

use crate::catalog::SourceCatalog;
use crate::error::ImportError;
use crate::processor::ChunkProcessor;

/// Snapshot of one admitted job.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub job_id: Uuid,
    pub source_id: String,
    pub worker: String,
    pub state: WorkerState,
    pub started_at: DateTime<Utc>,
}

// ── In-flight registry ───────────────────────────────────────────────

struct InFlight {
    source_id: String,
    control: WorkerControl,
    started_at: DateTime<Utc>,
}

struct Registry {
    jobs: Mutex<HashMap<Uuid, InFlight>>,
    count: watch::Sender<usize>,
}

impl Registry {
    fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            jobs: Mutex::new(HashMap::new()),
            count,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, InFlight>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a job. With `single_flight`, refuses a source that already
    /// has one.
    fn register(
        self: &Arc<Self>,
        source_id: &str,
        control: WorkerControl,
        single_flight: bool,
    ) -> Option<InFlightGuard> {
        let mut jobs = self.lock();
        if single_flight && jobs.values().any(|j| j.source_id == source_id) {
            return None;
        }
        let job_id = Uuid::new_v4();
        jobs.insert(
            job_id,
            InFlight {
                source_id: source_id.to_string(),
                control,
                started_at: Utc::now(),
            },
        );
        self.count.send_replace(jobs.len());
        Some(InFlightGuard {
            registry: self.clone(),
            job_id,
        })
    }

    fn release(&self, job_id: Uuid) {
        let mut jobs = self.lock();
        if jobs.remove(&job_id).is_some() {
            self.count.send_replace(jobs.len());
        }
    }

    fn controls(&self) -> Vec<WorkerControl> {
        self.lock().values().map(|j| j.control.clone()).collect()
    }
}

/// Removes the registry entry when the job future completes or is dropped.
struct InFlightGuard {
    registry: Arc<Registry>,
    job_id: Uuid,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.release(self.job_id);
    }
}

// ── Coordinator ──────────────────────────────────────────────────────

pub struct ImportCoordinator {
    catalog: Arc<dyn SourceCatalog>,
    files: Arc<dyn FileStore>,
    sink: Arc<BatchSink>,
    gate: Arc<SubmissionGate>,
    chunk: ChunkSettings,
    settings: ImportSettings,
    registry: Arc<Registry>,
}

impl ImportCoordinator {
    pub fn new(
        catalog: Arc<dyn SourceCatalog>,
        files: Arc<dyn FileStore>,
        sink: Arc<BatchSink>,
        gate: Arc<SubmissionGate>,
    ) -> Self {
        Self {
            catalog,
            files,
            sink,
            gate,
            chunk: ChunkSettings::default(),
            settings: ImportSettings::default(),
            registry: Arc::new(Registry::new()),
        }
    }

    pub fn with_chunk_settings(mut self, chunk: ChunkSettings) -> Self {
        self.chunk = chunk;
        self
    }

    pub fn with_import_settings(mut self, settings: ImportSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn gate(&self) -> &Arc<SubmissionGate> {
        &self.gate
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.gate.breaker()
    }

    /// Admit an import of `source_id`.
    ///
    /// `Ok(false)` means "retry later": the pool had no slot, the circuit
    /// was open, or (with single-flight on) the source is already running.
    pub async fn submit(&self, source_id: &str, is_first_time: bool) -> Result<bool, ImportError> {
        let source = self.catalog.get_source(source_id).await?.ok_or_else(|| {
            warn!(source = source_id, "import refused: source not found");
            ImportError::SourceNotFound(source_id.to_string())
        })?;

        if source.columns.is_empty() {
            warn!(source = source_id, "import refused: no column mapping");
            return Err(ImportError::SchemaNotReady(source_id.to_string()));
        }
        if source.delimiter().is_none() {
            warn!(source = source_id, connector = %source.connector, "import refused: unsupported connector");
            return Err(ImportError::UnsupportedConnector {
                source_id: source_id.to_string(),
                connector: source.connector.to_string(),
            });
        }
        if self.gate.pool().is_shutdown() {
            return Err(ImportError::PoolClosed);
        }

        let table = source.table_name();
        let worker = ChunkProcessor::new(
            source.clone(),
            self.files.clone(),
            self.sink.clone(),
            self.gate.breaker(),
            self.chunk.clone(),
        )
        .into_worker();
        let control = worker.control();

        let Some(guard) = self
            .registry
            .register(&source.id, control.clone(), self.settings.single_flight)
        else {
            info!(source = source_id, "import already in flight");
            return Ok(false);
        };
        let job_id = guard.job_id;

        if is_first_time {
            self.sink.create_table(&table, &source.columns).await?;
            info!(source = source_id, table = %table, columns = source.columns.len(), "provisioned table");
        }

        let job = async move {
            let _guard = guard;
            worker.run().await
        };

        let reason = match self.gate.try_submit(job).await {
            Ok(true) => {
                info!(source = source_id, table = %table, job = %job_id, "import accepted");
                return Ok(true);
            }
            Ok(false) => "no free slot".to_string(),
            Err(GateError::CircuitOpen { errors, threshold }) => {
                format!("circuit open ({errors} errors, threshold {threshold})")
            }
            Err(e) => return Err(e.into()),
        };

        // The refused job was dropped unstarted; this only releases it.
        control.shutdown(self.settings.reject_shutdown_timeout()).await;
        warn!(source = source_id, table = %table, %reason, "import rejected");
        Ok(false)
    }

    /// Zero the circuit breaker.
    pub fn reset_circuit(&self) {
        let errors = self.gate.breaker().error_count();
        self.gate.reset();
        info!(errors, "circuit breaker reset");
    }

    /// Jobs admitted and not yet finished, oldest first.
    pub fn in_flight(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = self
            .registry
            .lock()
            .iter()
            .map(|(id, job)| JobInfo {
                job_id: *id,
                source_id: job.source_id.clone(),
                worker: job.control.name().to_string(),
                state: job.control.state(),
                started_at: job.started_at,
            })
            .collect();
        jobs.sort_by_key(|j| j.started_at);
        jobs
    }

    /// Wait up to `timeout` for every admitted job to finish.
    pub async fn await_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.registry.count.subscribe();
        let idle = async move { rx.wait_for(|n| *n == 0).await.is_ok() };
        tokio::time::timeout(timeout, idle).await.unwrap_or(false)
    }

    /// Drain for process stop: refuse new jobs, shut every running job down
    /// (graceful, then forced after `timeout`) and wait for the pool.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.gate.shutdown();

        let controls = self.registry.controls();
        info!(jobs = controls.len(), ?timeout, "draining imports");
        let outcomes = join_all(controls.iter().map(|c| c.shutdown(timeout))).await;
        let forced = outcomes
            .iter()
            .filter(|o| **o == ShutdownOutcome::Forced)
            .count();

        let terminated = self.gate.await_termination(timeout).await;
        if terminated {
            info!(jobs = outcomes.len(), forced, "import pool drained");
        } else {
            warn!(jobs = outcomes.len(), forced, "import pool did not terminate in time");
        }
        terminated
    }
}
