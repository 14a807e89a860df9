//! End-to-end import tests: catalog → coordinator → gate → chunk processor → sink,
//! over an in-memory object store and the in-memory sink.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use tokio::sync::watch;

use sluice_core::config::{ChunkSettings, ImportSettings};
use sluice_core::TypeTag;
use sluice_ingest::{ImportCoordinator, ImportError, MemoryCatalog};
use sluice_pool::{CircuitBreaker, PoolBuilder, SubmissionGate};
use sluice_storage::{
    BatchSink, ByteStream, FileStore, MemorySink, ObjectFileStore, RowKeyGenerator, StorageError,
};

const TIMEOUT: Duration = Duration::from_secs(5);

const CATALOG: &str = r#"
[[sources]]
id = "S1"
connector = "csv"
location = "uploads/s1.csv"
columns = [
    { field = "a", column = "col_a", type = "text" },
    { field = "b", column = "col_b", type = "int" },
]

[[sources]]
id = "S2"
connector = "csv"
location = "uploads/s2.csv"
columns = [
    { field = "a", column = "col_a", type = "text" },
    { field = "b", column = "col_b", type = "int" },
]

[[sources]]
id = "S3"
connector = "csv"
location = "uploads/s3.csv"
columns = [
    { field = "a", column = "col_a", type = "text" },
    { field = "b", column = "col_b", type = "int" },
]

[[sources]]
id = "WIDE"
connector = "psv"
location = "uploads/wide.psv"
columns = [
    { field = "a", column = "col_a", type = "text" },
    { field = "b", column = "col_b", type = "int" },
    { field = "c", column = "col_c", type = "text", hidden = true },
]

[[sources]]
id = "NOSCHEMA"
connector = "csv"
location = "uploads/noschema.csv"

[[sources]]
id = "JDBC"
connector = "jdbc"
location = "db://elsewhere"
columns = [{ field = "a", column = "col_a", type = "text" }]
"#;

/// File store whose reads wait until the test opens the gate.
struct GatedFiles {
    inner: ObjectFileStore,
    open: watch::Receiver<bool>,
}

#[async_trait]
impl FileStore for GatedFiles {
    async fn stream_file(&self, path: &str) -> Result<ByteStream, StorageError> {
        let mut open = self.open.clone();
        let _ = open.wait_for(|o| *o).await;
        self.inner.stream_file(path).await
    }
}

struct Fixture {
    coordinator: ImportCoordinator,
    memory: Arc<MemorySink>,
    store: Arc<InMemory>,
    release: watch::Sender<bool>,
}

impl Fixture {
    async fn put(&self, path: &str, body: &'static [u8]) {
        self.store
            .put(&ObjectPath::from(path), PutPayload::from_static(body))
            .await
            .unwrap();
    }

    fn open_files(&self) {
        self.release.send_replace(true);
    }
}

struct Options {
    pool: PoolBuilder,
    breaker: CircuitBreaker,
    chunk_size: usize,
    single_flight: bool,
    gated: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            pool: PoolBuilder::new("import-test").core_size(2).max_size(2).queue_size(8),
            breaker: CircuitBreaker::new(10, Duration::from_millis(10)),
            chunk_size: 200,
            single_flight: true,
            gated: false,
        }
    }
}

fn fixture(opts: Options) -> Fixture {
    let store = Arc::new(InMemory::new());
    let (release, open) = watch::channel(!opts.gated);
    let files = Arc::new(GatedFiles {
        inner: ObjectFileStore::new(store.clone()),
        open,
    });

    let memory = Arc::new(MemorySink::new());
    let sink = Arc::new(BatchSink::new(memory.clone(), RowKeyGenerator::new(1).unwrap()));
    let gate = Arc::new(SubmissionGate::new(opts.pool.build().unwrap(), opts.breaker));
    let catalog = Arc::new(MemoryCatalog::from_toml_str(CATALOG).unwrap());

    let coordinator = ImportCoordinator::new(catalog, files, sink, gate)
        .with_chunk_settings(ChunkSettings {
            chunk_size: opts.chunk_size,
            parallelism: 2,
            queue_size: 4,
        })
        .with_import_settings(ImportSettings {
            single_flight: opts.single_flight,
            reject_shutdown_secs: 10,
            node_id: 1,
        });

    Fixture {
        coordinator,
        memory,
        store,
        release,
    }
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

fn values(memory: &MemorySink, table: &str) -> Vec<Vec<Option<String>>> {
    let mut rows: Vec<_> = memory.rows(table).into_iter().map(|r| r.values).collect();
    rows.sort();
    rows
}

fn cells(row: &[&str]) -> Vec<Option<String>> {
    row.iter()
        .map(|c| if c.is_empty() { None } else { Some(c.to_string()) })
        .collect()
}

#[tokio::test]
async fn first_import_provisions_table_and_writes_rows() {
    let fx = fixture(Options::default());
    fx.put("uploads/s1.csv", b"a,b\nx,1\ny,2\n").await;

    assert!(fx.coordinator.submit("S1", true).await.unwrap());
    assert!(fx.coordinator.await_idle(TIMEOUT).await);

    let table = fx.memory.table("t_S1").expect("table provisioned");
    let schema: Vec<_> = table.schema.iter().map(|(c, t)| (c.as_str(), *t)).collect();
    assert_eq!(schema, vec![("col_a", TypeTag::Text), ("col_b", TypeTag::Int)]);
    assert_eq!(values(&fx.memory, "t_S1"), vec![cells(&["x", "1"]), cells(&["y", "2"])]);

    let keys: Vec<i64> = fx.memory.rows("t_S1").iter().map(|r| r.key).collect();
    assert_ne!(keys[0], keys[1]);
}

#[tokio::test]
async fn malformed_rows_are_skipped_not_fatal() {
    let fx = fixture(Options::default());
    fx.put("uploads/wide.psv", b"a|b|c\n1|2\n3|4|5\n\n6||\n").await;

    assert!(fx.coordinator.submit("WIDE", true).await.unwrap());
    assert!(fx.coordinator.await_idle(TIMEOUT).await);

    assert_eq!(
        values(&fx.memory, "t_WIDE"),
        vec![cells(&["3", "4", "5"]), cells(&["6", "", ""])]
    );
    assert_eq!(fx.coordinator.breaker().error_count(), 0);
}

#[tokio::test]
async fn chunks_cover_every_row_once() {
    let fx = fixture(Options {
        chunk_size: 200,
        ..Options::default()
    });
    let mut body = String::from("a,b\n");
    for i in 0..1001 {
        body.push_str(&format!("r{i},{i}\n"));
    }
    let body: &'static [u8] = Box::leak(body.into_bytes().into_boxed_slice());
    fx.put("uploads/s1.csv", body).await;

    assert!(fx.coordinator.submit("S1", true).await.unwrap());
    assert!(fx.coordinator.await_idle(TIMEOUT).await);

    let mut seen: Vec<u32> = fx
        .memory
        .rows("t_S1")
        .iter()
        .map(|r| r.values[1].as_deref().unwrap().parse().unwrap())
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..1001).collect::<Vec<u32>>());
}

#[tokio::test]
async fn admission_errors() {
    let fx = fixture(Options::default());

    assert!(matches!(
        fx.coordinator.submit("MISSING", true).await,
        Err(ImportError::SourceNotFound(id)) if id == "MISSING"
    ));
    assert!(matches!(
        fx.coordinator.submit("NOSCHEMA", true).await,
        Err(ImportError::SchemaNotReady(id)) if id == "NOSCHEMA"
    ));
    assert!(matches!(
        fx.coordinator.submit("JDBC", true).await,
        Err(ImportError::UnsupportedConnector { .. })
    ));
    assert!(fx.memory.table_names().is_empty());
}

#[tokio::test]
async fn saturated_pool_rejects_without_blocking() {
    let fx = fixture(Options {
        pool: PoolBuilder::new("import-test").core_size(1).max_size(1).queue_size(1),
        gated: true,
        ..Options::default()
    });
    for path in ["uploads/s1.csv", "uploads/s2.csv", "uploads/s3.csv"] {
        fx.put(path, b"a,b\nx,1\n").await;
    }

    assert!(fx.coordinator.submit("S1", true).await.unwrap());
    assert!(fx.coordinator.submit("S2", true).await.unwrap());
    let third = tokio::time::timeout(TIMEOUT, fx.coordinator.submit("S3", true))
        .await
        .expect("rejection must not block");
    assert!(!third.unwrap());

    let mut running: Vec<String> = fx.coordinator.in_flight().into_iter().map(|j| j.source_id).collect();
    running.sort();
    assert_eq!(running, vec!["S1".to_string(), "S2".to_string()]);

    fx.open_files();
    assert!(fx.coordinator.await_idle(TIMEOUT).await);
    assert_eq!(fx.memory.rows("t_S1").len(), 1);
    assert_eq!(fx.memory.rows("t_S2").len(), 1);
    assert!(fx.memory.rows("t_S3").is_empty());
}

#[tokio::test]
async fn single_flight_refuses_overlapping_import() {
    let fx = fixture(Options {
        gated: true,
        ..Options::default()
    });
    fx.put("uploads/s1.csv", b"a,b\nx,1\n").await;

    assert!(fx.coordinator.submit("S1", true).await.unwrap());
    assert!(!fx.coordinator.submit("S1", false).await.unwrap());
    assert_eq!(fx.coordinator.in_flight().len(), 1);

    fx.open_files();
    assert!(fx.coordinator.await_idle(TIMEOUT).await);
    assert!(fx.coordinator.submit("S1", false).await.unwrap());
    assert!(fx.coordinator.await_idle(TIMEOUT).await);
    assert_eq!(fx.memory.rows("t_S1").len(), 2);
}

#[tokio::test]
async fn overlapping_imports_allowed_without_single_flight() {
    let fx = fixture(Options {
        single_flight: false,
        gated: true,
        ..Options::default()
    });
    fx.put("uploads/s1.csv", b"a,b\nx,1\n").await;

    assert!(fx.coordinator.submit("S1", true).await.unwrap());
    assert!(fx.coordinator.submit("S1", false).await.unwrap());

    fx.open_files();
    assert!(fx.coordinator.await_idle(TIMEOUT).await);
    assert_eq!(fx.memory.rows("t_S1").len(), 2);
}

#[tokio::test]
async fn failed_chunks_open_the_circuit() {
    let fx = fixture(Options {
        breaker: CircuitBreaker::new(0, Duration::from_millis(20)),
        chunk_size: 1,
        ..Options::default()
    });
    fx.put("uploads/s1.csv", b"a,b\nx,1\ny,2\nz,3\n").await;
    let breaker = fx.coordinator.breaker();

    // No table: all three chunk writes fail, then the job itself succeeds.
    assert!(fx.coordinator.submit("S1", false).await.unwrap());
    assert!(fx.coordinator.await_idle(TIMEOUT).await);
    assert!(eventually(|| breaker.error_count() == 2).await);

    let started = tokio::time::Instant::now();
    assert!(!fx.coordinator.submit("S1", true).await.unwrap());
    assert!(started.elapsed() >= Duration::from_millis(20));
    assert_eq!(breaker.error_count(), 1);
    assert!(fx.memory.table("t_S1").is_some());

    fx.coordinator.reset_circuit();
    assert!(fx.coordinator.submit("S1", false).await.unwrap());
    assert!(fx.coordinator.await_idle(TIMEOUT).await);
    assert_eq!(fx.memory.rows("t_S1").len(), 3);
    assert!(eventually(|| breaker.error_count() == 0).await);
}

#[tokio::test]
async fn healthy_job_decays_breaker_once() {
    let fx = fixture(Options {
        chunk_size: 1,
        ..Options::default()
    });
    fx.put("uploads/s1.csv", b"a,b\nw,0\nx,1\ny,2\nz,3\n").await;
    let breaker = fx.coordinator.breaker();
    for _ in 0..5 {
        breaker.record_failure(&anyhow::anyhow!("earlier import failed"));
    }

    // Four successful chunks, one successful job.
    assert!(fx.coordinator.submit("S1", true).await.unwrap());
    assert!(fx.coordinator.await_idle(TIMEOUT).await);
    assert!(eventually(|| breaker.error_count() == 4).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(breaker.error_count(), 4);
    assert_eq!(fx.memory.rows("t_S1").len(), 4);
}

#[tokio::test]
async fn stray_quote_does_not_swallow_following_rows() {
    let fx = fixture(Options::default());
    fx.put("uploads/s1.csv", b"a,b\n5\" pipe,1\ny,2\nz,3\n").await;

    assert!(fx.coordinator.submit("S1", true).await.unwrap());
    assert!(fx.coordinator.await_idle(TIMEOUT).await);
    assert_eq!(
        values(&fx.memory, "t_S1"),
        vec![cells(&["5\" pipe", "1"]), cells(&["y", "2"]), cells(&["z", "3"])]
    );
}

#[tokio::test]
async fn empty_header_fails_the_job() {
    let fx = fixture(Options::default());
    fx.put("uploads/s1.csv", b"\nx,1\n").await;
    let breaker = fx.coordinator.breaker();

    assert!(fx.coordinator.submit("S1", true).await.unwrap());
    assert!(fx.coordinator.await_idle(TIMEOUT).await);
    assert!(eventually(|| breaker.error_count() == 1).await);
    assert!(fx.memory.rows("t_S1").is_empty());
}

#[tokio::test]
async fn drain_forces_blocked_imports_and_closes_admission() {
    let fx = fixture(Options {
        gated: true,
        ..Options::default()
    });
    fx.put("uploads/s1.csv", b"a,b\nx,1\n").await;
    assert!(fx.coordinator.submit("S1", true).await.unwrap());

    // The job is stuck opening its file and never polls the flag.
    assert!(fx.coordinator.shutdown(Duration::from_millis(100)).await);
    assert!(fx.coordinator.in_flight().is_empty());
    assert_eq!(fx.coordinator.breaker().error_count(), 0);

    assert!(matches!(
        fx.coordinator.submit("S1", false).await,
        Err(ImportError::PoolClosed)
    ));
}
