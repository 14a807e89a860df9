//! Streaming import of delimited files into a destination store.

pub mod catalog;
pub mod chunker;
pub mod coordinator;
pub mod error;
pub mod processor;
pub mod reader;

pub use catalog::{MemoryCatalog, SourceCatalog};
pub use chunker::{Chunk, Chunker};
pub use coordinator::{ImportCoordinator, JobInfo};
pub use error::{CatalogError, ImportError, IngestError};
pub use processor::{ChunkProcessor, ImportSummary};
pub use reader::{RawRecord, RecordReader};
