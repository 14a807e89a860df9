//! Where source descriptors come from.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use sluice_core::SourceDescriptor;

use crate::error::CatalogError;

#[async_trait]
pub trait SourceCatalog: Send + Sync {
    /// `Ok(None)` when the source is unknown.
    async fn get_source(&self, source_id: &str) -> Result<Option<Arc<SourceDescriptor>>, CatalogError>;
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    sources: Vec<SourceDescriptor>,
}

/// In-memory catalog, optionally loaded from a TOML file of `[[sources]]`.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    sources: RwLock<HashMap<String, Arc<SourceDescriptor>>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml_str(s: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = toml::from_str(s)?;
        let catalog = Self::new();
        for source in file.sources {
            if catalog.get(&source.id).is_some() {
                return Err(CatalogError::Duplicate(source.id));
            }
            catalog.insert(source);
        }
        Ok(catalog)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, CatalogError> {
        let text = std::fs::read_to_string(path)?;
        let catalog = Self::from_toml_str(&text)?;
        info!(path = %path.display(), sources = catalog.len(), "loaded source catalog");
        Ok(catalog)
    }

    /// Add or replace a source.
    pub fn insert(&self, source: SourceDescriptor) {
        self.sources
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(source.id.clone(), Arc::new(source));
    }

    pub fn get(&self, source_id: &str) -> Option<Arc<SourceDescriptor>> {
        self.sources
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(source_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.sources.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SourceCatalog for MemoryCatalog {
    async fn get_source(&self, source_id: &str) -> Result<Option<Arc<SourceDescriptor>>, CatalogError> {
        Ok(self.get(source_id))
    }
}
