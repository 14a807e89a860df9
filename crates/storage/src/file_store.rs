//! Sequential byte streams over source files.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tracing::debug;

use crate::backend::StorageBackend;
use crate::error::StorageError;

/// A file's bytes in read order, one read position.
pub type ByteStream = BoxStream<'static, Result<Bytes, StorageError>>;

#[async_trait]
pub trait FileStore: Send + Sync {
    async fn stream_file(&self, path: &str) -> Result<ByteStream, StorageError>;
}

/// [`FileStore`] over any `object_store` backend.
pub struct ObjectFileStore {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ObjectFileStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            prefix: String::new(),
        }
    }

    pub fn from_backend(backend: &StorageBackend) -> Self {
        Self {
            store: backend.store_arc(),
            prefix: backend.prefix().to_string(),
        }
    }

    fn object_path(&self, path: &str) -> ObjectPath {
        let path = path.trim_start_matches('/');
        if self.prefix.is_empty() {
            ObjectPath::from(path)
        } else {
            ObjectPath::from(format!("{}/{}", self.prefix, path))
        }
    }
}

#[async_trait]
impl FileStore for ObjectFileStore {
    async fn stream_file(&self, path: &str) -> Result<ByteStream, StorageError> {
        let location = self.object_path(path);
        let result = self.store.get(&location).await?;
        debug!(path = %location, size = result.meta.size, "opened source stream");
        Ok(result.into_stream().map_err(StorageError::from).boxed())
    }
}
