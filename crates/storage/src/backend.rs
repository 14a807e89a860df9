use std::path::{Path, PathBuf};
use std::sync::Arc;

use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::ObjectStore;

use sluice_core::config::AwsConfig;
use sluice_core::Config;

use crate::error::StorageError;

/// Where source files are read from.
#[derive(Clone)]
pub enum StorageBackend {
    Local {
        store: Arc<dyn ObjectStore>,
        data_dir: PathBuf,
    },
    S3 {
        store: Arc<dyn ObjectStore>,
        bucket: String,
        prefix: String,
    },
    /// Process-local store for tests and dry runs.
    Memory(Arc<InMemory>),
}

impl StorageBackend {
    /// Select the backend named by `STORAGE_BACKEND`.
    pub fn from_config(config: &Config) -> Result<Self, StorageError> {
        match config.storage.backend.as_str() {
            "s3" => Self::s3(&config.aws),
            "memory" => Ok(Self::memory()),
            "local" => {
                std::fs::create_dir_all(&config.storage.data_dir)?;
                Self::local(&config.storage.data_dir)
            }
            other => Err(StorageError::NotConfigured(format!(
                "unknown storage backend '{other}' (expected local, s3 or memory)"
            ))),
        }
    }

    /// Files under `data_dir`, which must exist.
    pub fn local(data_dir: &Path) -> Result<Self, StorageError> {
        let data_dir = std::fs::canonicalize(data_dir).unwrap_or_else(|_| data_dir.to_path_buf());
        let store = LocalFileSystem::new_with_prefix(&data_dir)?;
        Ok(StorageBackend::Local {
            store: Arc::new(store),
            data_dir,
        })
    }

    /// S3 or an S3-compatible endpoint. Missing static credentials fall
    /// back to the provider chain of the object store.
    pub fn s3(aws: &AwsConfig) -> Result<Self, StorageError> {
        let bucket = aws
            .s3_bucket
            .as_deref()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| StorageError::NotConfigured("S3_BUCKET not set".into()))?;

        let mut builder = AmazonS3Builder::new()
            .with_region(&aws.region)
            .with_bucket_name(bucket);
        if let Some(key) = &aws.access_key_id {
            builder = builder.with_access_key_id(key);
        }
        if let Some(secret) = &aws.secret_access_key {
            builder = builder.with_secret_access_key(secret);
        }
        if let Some(token) = &aws.session_token {
            builder = builder.with_token(token);
        }
        if let Some(endpoint) = aws.endpoint_url.as_deref().and_then(endpoint_url) {
            builder = builder
                .with_allow_http(endpoint.starts_with("http://"))
                .with_endpoint(endpoint);
        }

        Ok(StorageBackend::S3 {
            store: Arc::new(builder.build()?),
            bucket: bucket.to_string(),
            prefix: aws.s3_prefix.as_deref().unwrap_or("").trim_matches('/').to_string(),
        })
    }

    pub fn memory() -> Self {
        StorageBackend::Memory(Arc::new(InMemory::new()))
    }

    pub fn store(&self) -> &dyn ObjectStore {
        match self {
            StorageBackend::Local { store, .. } | StorageBackend::S3 { store, .. } => store.as_ref(),
            StorageBackend::Memory(m) => m.as_ref(),
        }
    }

    pub fn store_arc(&self) -> Arc<dyn ObjectStore> {
        match self {
            StorageBackend::Local { store, .. } | StorageBackend::S3 { store, .. } => store.clone(),
            StorageBackend::Memory(m) => m.clone(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, StorageBackend::S3 { .. })
    }

    /// Key prefix prepended to every source location (S3 only).
    pub fn prefix(&self) -> &str {
        match self {
            StorageBackend::S3 { prefix, .. } => prefix,
            _ => "",
        }
    }

    pub fn describe(&self) -> String {
        match self {
            StorageBackend::Local { data_dir, .. } => format!("local:{}", data_dir.display()),
            StorageBackend::S3 { bucket, prefix, .. } if prefix.is_empty() => format!("s3://{bucket}"),
            StorageBackend::S3 { bucket, prefix, .. } => format!("s3://{bucket}/{prefix}"),
            StorageBackend::Memory(_) => "memory".to_string(),
        }
    }
}

/// Absolute endpoint URL; a bare `host:port` is taken as https.
fn endpoint_url(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        None
    } else if raw.starts_with("http://") || raw.starts_with("https://") {
        Some(raw.to_string())
    } else {
        Some(format!("https://{raw}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aws(bucket: Option<&str>, prefix: Option<&str>, endpoint: Option<&str>) -> AwsConfig {
        AwsConfig {
            region: "eu-west-1".into(),
            access_key_id: Some("key".into()),
            secret_access_key: Some("secret".into()),
            session_token: None,
            s3_bucket: bucket.map(Into::into),
            s3_prefix: prefix.map(Into::into),
            endpoint_url: endpoint.map(Into::into),
        }
    }

    #[test]
    fn local_backend_creates() {
        let tmp = std::env::temp_dir().join("sluice-storage-backend-test");
        std::fs::create_dir_all(&tmp).unwrap();
        let backend = StorageBackend::local(&tmp).unwrap();
        assert!(!backend.is_remote());
        assert_eq!(backend.prefix(), "");
        assert!(backend.describe().starts_with("local:"));
        std::fs::remove_dir_all(&tmp).ok();
    }

    #[test]
    fn s3_backend_requires_bucket() {
        assert!(matches!(
            StorageBackend::s3(&aws(None, None, None)),
            Err(StorageError::NotConfigured(_))
        ));
        assert!(matches!(
            StorageBackend::s3(&aws(Some(""), None, None)),
            Err(StorageError::NotConfigured(_))
        ));
    }

    #[test]
    fn s3_prefix_is_trimmed() {
        let backend = StorageBackend::s3(&aws(Some("imports"), Some("/uploads/"), Some("localhost:9000"))).unwrap();
        assert!(backend.is_remote());
        assert_eq!(backend.prefix(), "uploads");
        assert_eq!(backend.describe(), "s3://imports/uploads");
    }

    #[test]
    fn endpoint_urls_are_absolute() {
        assert_eq!(endpoint_url("minio:9000").as_deref(), Some("https://minio:9000"));
        assert_eq!(endpoint_url("http://minio:9000").as_deref(), Some("http://minio:9000"));
        assert_eq!(endpoint_url("  "), None);
    }
}
