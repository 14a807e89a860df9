//! Destination stores.
//!
//! A [`Sink`] provisions tables and appends rows. Rows arrive already keyed
//! and with values aligned to the table schema; `None` is SQL NULL.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, info};

use sluice_core::config::PostgresConfig;
use sluice_core::TableSchema;

use crate::error::StorageError;

/// Name of the key column every destination table starts with.
pub const ROW_KEY_COLUMN: &str = "row_key";

/// PostgreSQL's per-statement bind parameter limit.
const MAX_BIND_PARAMS: usize = 65_535;

/// One destination row: its key plus one value per schema column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub key: i64,
    pub values: Vec<Option<String>>,
}

#[async_trait]
pub trait Sink: Send + Sync {
    /// Create `table` if it does not exist.
    async fn create_table(&self, table: &str, schema: &TableSchema) -> Result<(), StorageError>;

    /// Append `rows`; returns how many were written.
    async fn batch_insert(
        &self,
        table: &str,
        schema: &TableSchema,
        rows: &[Row],
    ) -> Result<u64, StorageError>;
}

// ── PostgreSQL ───────────────────────────────────────────────────────

pub struct PgSink {
    pool: PgPool,
}

impl PgSink {
    pub async fn connect(config: &PostgresConfig) -> Result<Self, StorageError> {
        if !config.is_configured() {
            return Err(StorageError::NotConfigured("PG_USERNAME not set".into()));
        }
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.connection_string())
            .await?;
        info!("PostgreSQL connected: {}/{}", config.host, config.database);
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Sink for PgSink {
    async fn create_table(&self, table: &str, schema: &TableSchema) -> Result<(), StorageError> {
        let ddl = create_table_sql(table, schema);
        debug!(table, sql = %ddl, "provisioning table");
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }

    async fn batch_insert(
        &self,
        table: &str,
        schema: &TableSchema,
        rows: &[Row],
    ) -> Result<u64, StorageError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for part in rows.chunks(rows_per_statement(schema.len())) {
            let mut query = insert_query(table, schema, part);
            written += query.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn create_table_sql(table: &str, schema: &TableSchema) -> String {
    let mut columns = vec![format!("{} BIGINT PRIMARY KEY", quote_ident(ROW_KEY_COLUMN))];
    columns.extend(
        schema
            .iter()
            .map(|(name, tag)| format!("{} {}", quote_ident(name), tag.sql_type())),
    );
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(table),
        columns.join(", ")
    )
}

fn rows_per_statement(columns: usize) -> usize {
    (MAX_BIND_PARAMS / (columns + 1)).max(1)
}

/// Multi-row insert; values are bound as text and cast to the column type.
fn insert_query<'a>(table: &str, schema: &TableSchema, rows: &'a [Row]) -> QueryBuilder<'a, Postgres> {
    let column_list: Vec<String> = std::iter::once(ROW_KEY_COLUMN)
        .chain(schema.keys().map(String::as_str))
        .map(quote_ident)
        .collect();

    let mut builder = QueryBuilder::new(format!(
        "INSERT INTO {} ({}) ",
        quote_ident(table),
        column_list.join(", ")
    ));
    builder.push_values(rows, |mut b, row| {
        b.push_bind(row.key);
        for (value, tag) in row.values.iter().zip(schema.values()) {
            b.push_bind(value.as_deref());
            if !tag.is_text() {
                b.push_unseparated(format!("::{}", tag.sql_type()));
            }
        }
    });
    builder
}

// ── In-memory ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MemoryTable {
    pub schema: TableSchema,
    pub rows: Vec<Row>,
}

/// [`Sink`] that keeps tables in process memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    tables: Mutex<HashMap<String, MemoryTable>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self, name: &str) -> Option<MemoryTable> {
        self.lock().get(name).cloned()
    }

    pub fn rows(&self, name: &str) -> Vec<Row> {
        self.lock().get(name).map(|t| t.rows.clone()).unwrap_or_default()
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemoryTable>> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn create_table(&self, table: &str, schema: &TableSchema) -> Result<(), StorageError> {
        self.lock()
            .entry(table.to_string())
            .or_insert_with(|| MemoryTable {
                schema: schema.clone(),
                rows: Vec::new(),
            });
        Ok(())
    }

    async fn batch_insert(
        &self,
        table: &str,
        schema: &TableSchema,
        rows: &[Row],
    ) -> Result<u64, StorageError> {
        let mut tables = self.lock();
        let target = tables
            .get_mut(table)
            .ok_or_else(|| StorageError::TableNotFound(table.to_string()))?;

        if let Some(missing) = schema.keys().find(|c| !target.schema.contains_key(*c)) {
            return Err(StorageError::Other(format!(
                "column '{missing}' does not exist in {table}"
            )));
        }
        if let Some(bad) = rows.iter().find(|r| r.values.len() != schema.len()) {
            return Err(StorageError::Other(format!(
                "row {} has {} values for {} columns",
                bad.key,
                bad.values.len(),
                schema.len()
            )));
        }

        target.rows.extend_from_slice(rows);
        Ok(rows.len() as u64)
    }
}
