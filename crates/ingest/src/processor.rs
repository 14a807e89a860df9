//! Streaming chunk processor.
//!
//! Reads one source file sequentially, cuts it into fixed-size chunks and
//! writes the chunks in parallel on a private bounded pool. Row-level
//! problems skip the row; chunk-level write failures are logged, reported
//! to the shared circuit breaker and do not stop the stream; a stream
//! failure ends the job after the chunks already submitted have finished.
//! Successful chunks leave the breaker alone: only the job's own outcome,
//! recorded by the submission gate, decays the count.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use sluice_core::config::ChunkSettings;
use sluice_core::{ColumnMapping, SourceDescriptor};
use sluice_pool::{CircuitBreaker, ManagedWorker, PoolBuilder, RejectionPolicy, WorkerContext, WorkerPool};
use sluice_storage::{BatchSink, FileStore};

use crate::chunker::{Chunk, Chunker};
use crate::error::IngestError;
use crate::reader::{RawRecord, RecordReader};

/// Outcome of one import job, logged when the job ends.
#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub source_id: String,
    pub table: String,
    pub rows_read: u64,
    pub rows_skipped: u64,
    pub chunks_submitted: usize,
    pub chunks_failed: usize,
    pub rows_written: u64,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Counters shared with chunk tasks.
#[derive(Debug, Default)]
struct ChunkStats {
    failed: AtomicUsize,
    rows_written: AtomicU64,
    rows_skipped: AtomicU64,
}

/// What the read loop saw.
#[derive(Debug, Default)]
struct ReadStats {
    rows_read: u64,
    rows_skipped: u64,
    chunks_submitted: usize,
    cancelled: bool,
}

/// Everything a chunk task needs, shared across the tasks of one job.
struct ChunkTarget {
    source_id: String,
    table: String,
    mapping: Vec<ColumnMapping>,
    sink: Arc<BatchSink>,
    breaker: Arc<CircuitBreaker>,
    stats: ChunkStats,
}

pub struct ChunkProcessor {
    source: Arc<SourceDescriptor>,
    files: Arc<dyn FileStore>,
    sink: Arc<BatchSink>,
    breaker: Arc<CircuitBreaker>,
    settings: ChunkSettings,
}

impl ChunkProcessor {
    pub fn new(
        source: Arc<SourceDescriptor>,
        files: Arc<dyn FileStore>,
        sink: Arc<BatchSink>,
        breaker: Arc<CircuitBreaker>,
        settings: ChunkSettings,
    ) -> Self {
        Self {
            source,
            files,
            sink,
            breaker,
            settings,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source.id
    }

    /// Wrap the processor in a managed worker named `import-{source}`.
    pub fn into_worker(self) -> ManagedWorker {
        let name = format!("import-{}", self.source.id);
        ManagedWorker::new(name, move |ctx| async move {
            self.process(&ctx).await?;
            Ok(())
        })
    }

    /// Run the import, polling `ctx` between rows.
    pub async fn process(&self, ctx: &WorkerContext) -> Result<ImportSummary, IngestError> {
        let started_at = Utc::now();
        let source = &self.source;
        let table = source.table_name();

        let delimiter = source
            .delimiter()
            .ok_or_else(|| IngestError::UnsupportedConnector {
                connector: source.connector.to_string(),
            })?;

        let stream = self.files.stream_file(&source.location).await?;
        let mut reader = RecordReader::new(stream, delimiter);
        let header = read_header(&mut reader, &source.location).await.map_err(|e| {
            error!(source = %source.id, location = %source.location, error = %e, "cannot read header");
            e
        })?;
        info!(source = %source.id, table = %table, columns = header.len(), "streaming source");

        let pool = self.chunk_pool()?;
        let target = Arc::new(ChunkTarget {
            source_id: source.id.clone(),
            table: table.clone(),
            mapping: source.columns.clone(),
            sink: self.sink.clone(),
            breaker: self.breaker.clone(),
            stats: ChunkStats::default(),
        });

        let mut read = ReadStats::default();
        let streamed = self
            .stream_chunks(ctx, &mut reader, header, &pool, &target, &mut read)
            .await;

        // Chunks already handed out finish even when the stream failed.
        pool.shutdown();
        pool.terminated().await;

        let summary = ImportSummary {
            source_id: source.id.clone(),
            table,
            rows_read: read.rows_read,
            rows_skipped: read.rows_skipped + target.stats.rows_skipped.load(Ordering::Relaxed),
            chunks_submitted: read.chunks_submitted,
            chunks_failed: target.stats.failed.load(Ordering::Relaxed),
            rows_written: target.stats.rows_written.load(Ordering::Relaxed),
            cancelled: read.cancelled,
            started_at,
            finished_at: Utc::now(),
        };

        match streamed {
            Ok(()) => {
                info!(
                    source = %summary.source_id,
                    table = %summary.table,
                    rows = summary.rows_read,
                    skipped = summary.rows_skipped,
                    written = summary.rows_written,
                    chunks = summary.chunks_submitted,
                    failed = summary.chunks_failed,
                    cancelled = summary.cancelled,
                    elapsed_ms = (summary.finished_at - summary.started_at).num_milliseconds(),
                    "import finished"
                );
                Ok(summary)
            }
            Err(e) => {
                error!(
                    source = %summary.source_id,
                    table = %summary.table,
                    rows = summary.rows_read,
                    chunks = summary.chunks_submitted,
                    error = %e,
                    "import aborted"
                );
                Err(e)
            }
        }
    }

    async fn stream_chunks(
        &self,
        ctx: &WorkerContext,
        reader: &mut RecordReader,
        header: Vec<String>,
        pool: &WorkerPool,
        target: &Arc<ChunkTarget>,
        read: &mut ReadStats,
    ) -> Result<(), IngestError> {
        let width = header.len();
        let mut chunker = Chunker::new(header.into(), self.settings.chunk_size);

        loop {
            if ctx.is_shutting_down() {
                read.cancelled = true;
                warn!(
                    source = %target.source_id,
                    rows = read.rows_read,
                    dropped = chunker.pending(),
                    "shutdown requested, stopping import"
                );
                return Ok(());
            }

            let Some(record) = reader.next_record().await? else {
                break;
            };
            match record {
                RawRecord::Blank => continue,
                RawRecord::Malformed { record, reason } => {
                    read.rows_read += 1;
                    read.rows_skipped += 1;
                    warn!(source = %target.source_id, record, %reason, "skipping malformed row");
                }
                RawRecord::Row(cells) => {
                    read.rows_read += 1;
                    if cells.len() != width {
                        read.rows_skipped += 1;
                        warn!(
                            source = %target.source_id,
                            record = reader.records(),
                            expected = width,
                            actual = cells.len(),
                            "skipping row with mismatched column count"
                        );
                        continue;
                    }
                    if let Some(chunk) = chunker.push(cells) {
                        submit_chunk(pool, target, chunk).await?;
                        read.chunks_submitted += 1;
                    }
                }
            }
        }

        if let Some(chunk) = chunker.finish() {
            submit_chunk(pool, target, chunk).await?;
            read.chunks_submitted += 1;
        }
        Ok(())
    }

    fn chunk_pool(&self) -> Result<WorkerPool, IngestError> {
        let parallelism = self.settings.parallelism();
        let pool = PoolBuilder::new(format!("chunk-{}", self.source.id))
            .core_size(parallelism)
            .max_size(parallelism)
            .queue_size(self.settings.queue_capacity())
            .daemon(true)
            .rejection_policy(RejectionPolicy::CallerRuns)
            .build()?;
        Ok(pool)
    }
}

async fn read_header(reader: &mut RecordReader, location: &str) -> Result<Vec<String>, IngestError> {
    match reader.next_record().await? {
        Some(RawRecord::Row(cells)) if cells.iter().any(|c| !c.trim().is_empty()) => Ok(cells),
        Some(RawRecord::Malformed { reason, .. }) => Err(IngestError::InvalidHeader {
            location: location.to_string(),
            reason,
        }),
        _ => Err(IngestError::EmptyHeader {
            location: location.to_string(),
        }),
    }
}

async fn submit_chunk(
    pool: &WorkerPool,
    target: &Arc<ChunkTarget>,
    chunk: Chunk,
) -> Result<(), IngestError> {
    let target = target.clone();
    debug!(source = %target.source_id, chunk = chunk.seq, rows = chunk.len(), "submitting chunk");
    pool.execute(write_chunk(target, chunk)).await?;
    Ok(())
}

async fn write_chunk(target: Arc<ChunkTarget>, chunk: Chunk) {
    let (records, skipped) = chunk.records();
    if skipped > 0 {
        target.stats.rows_skipped.fetch_add(skipped as u64, Ordering::Relaxed);
        warn!(source = %target.source_id, chunk = chunk.seq, rows = skipped, "dropped rows with mismatched width");
    }

    match target.sink.batch_write(&target.table, &target.mapping, &records).await {
        Ok(written) => {
            target.stats.rows_written.fetch_add(written, Ordering::Relaxed);
            debug!(source = %target.source_id, table = %target.table, chunk = chunk.seq, rows = written, "chunk written");
        }
        Err(e) => {
            target.stats.failed.fetch_add(1, Ordering::Relaxed);
            let err = anyhow::Error::from(e);
            target.breaker.record_failure(&err);
            error!(
                source = %target.source_id,
                table = %target.table,
                chunk = chunk.seq,
                rows = records.len(),
                errors = target.breaker.error_count(),
                error = %err,
                "chunk write failed"
            );
        }
    }
}
