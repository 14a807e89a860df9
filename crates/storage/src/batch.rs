//! The write path used by chunk tasks.

use std::sync::Arc;

use tracing::debug;

use sluice_core::{table_schema, ColumnMapping, Record};

use crate::error::StorageError;
use crate::row_key::RowKeyGenerator;
use crate::sink::{Row, Sink};

/// Keys, coerces and writes mapped records to a [`Sink`].
pub struct BatchSink {
    sink: Arc<dyn Sink>,
    keys: RowKeyGenerator,
}

impl BatchSink {
    pub fn new(sink: Arc<dyn Sink>, keys: RowKeyGenerator) -> Self {
        Self { sink, keys }
    }

    pub fn sink(&self) -> &Arc<dyn Sink> {
        &self.sink
    }

    pub async fn create_table(
        &self,
        table: &str,
        mapping: &[ColumnMapping],
    ) -> Result<(), StorageError> {
        let schema = table_schema(mapping);
        self.sink.create_table(table, &schema).await?;
        debug!(table, columns = schema.len(), "table ready");
        Ok(())
    }

    /// Write one chunk's records in a single insert.
    ///
    /// Every record gets a fresh row key. A mapped field that is missing or
    /// empty becomes NULL. Failures are returned to the caller unretried.
    pub async fn batch_write(
        &self,
        table: &str,
        mapping: &[ColumnMapping],
        records: &[Record],
    ) -> Result<u64, StorageError> {
        if records.is_empty() {
            return Ok(0);
        }
        let schema = table_schema(mapping);
        let rows: Vec<Row> = records.iter().map(|r| self.to_row(mapping, r)).collect();
        self.sink.batch_insert(table, &schema, &rows).await
    }

    fn to_row(&self, mapping: &[ColumnMapping], record: &Record) -> Row {
        Row {
            key: self.keys.next_key(),
            values: mapping
                .iter()
                .map(|m| record.get(&m.field).filter(|v| !v.is_empty()).cloned())
                .collect(),
        }
    }
}
