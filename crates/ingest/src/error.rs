use thiserror::Error;

use sluice_pool::{GateError, PoolError};
use sluice_storage::StorageError;

/// Failures of one streaming import job.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("empty header in {location}")]
    EmptyHeader { location: String },

    #[error("unreadable header in {location}: {reason}")]
    InvalidHeader { location: String, reason: String },

    #[error("connector '{connector}' cannot be streamed")]
    UnsupportedConnector { connector: String },

    #[error("stream error: {0}")]
    Stream(#[from] StorageError),

    #[error("chunk pool error: {0}")]
    Pool(#[from] PoolError),
}

/// Admission failures reported to the caller of `submit`.
#[derive(Error, Debug)]
pub enum ImportError {
    #[error("source not found: {0}")]
    SourceNotFound(String),

    #[error("source {0} has no column mapping")]
    SchemaNotReady(String),

    #[error("source {source_id} uses unsupported connector '{connector}'")]
    UnsupportedConnector { source_id: String, connector: String },

    #[error("import pool is closed")]
    PoolClosed,

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("provisioning failed: {0}")]
    Provision(#[from] StorageError),

    #[error("submission failed: {0}")]
    Gate(GateError),
}

impl From<GateError> for ImportError {
    fn from(e: GateError) -> Self {
        match e {
            GateError::PoolClosed => ImportError::PoolClosed,
            other => ImportError::Gate(other),
        }
    }
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid catalog file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("duplicate source id: {0}")]
    Duplicate(String),
}
