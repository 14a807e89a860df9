//! Source file access and the destination write path.

pub mod backend;
pub mod batch;
pub mod error;
pub mod file_store;
pub mod row_key;
pub mod sink;

pub use backend::StorageBackend;
pub use batch::BatchSink;
pub use error::StorageError;
pub use file_store::{ByteStream, FileStore, ObjectFileStore};
pub use row_key::RowKeyGenerator;
pub use sink::{MemorySink, PgSink, Row, Sink};
