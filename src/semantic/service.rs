//! The process-wide visual search service.
//!
//! Owns the embedding generator, the index registry and the snapshot store.
//! Created once at startup and shared by `Arc` with the search path and the
//! indexing jobs.

use std::sync::Arc;

use serde::Serialize;

use crate::config::{Config, SearchConfig};
use crate::semantic::embeddings::{EmbeddingError, EmbeddingGenerator};
use crate::semantic::registry::{IndexRegistry, IndexStats, LoadReport, RegistryError};
use crate::storage::{BackendLocal, StorageManager};
use crate::tenant::TenantId;

/// Errors that can occur while starting the service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Storage error: {0}")]
    Io(#[from] std::io::Error),
}

/// Summary reported by [`VisualSearch::health`].
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub model: String,
    pub dimensions: usize,
    pub tenants: usize,
}

pub struct VisualSearch {
    generator: EmbeddingGenerator,
    registry: IndexRegistry,
    snapshots: Arc<dyn StorageManager>,
    pub(crate) search_config: SearchConfig,
}

impl VisualSearch {
    /// Load the model, then every snapshot under the configured index dir.
    pub fn start(config: &Config) -> Result<Arc<Self>, ServiceError> {
        let generator = EmbeddingGenerator::initialize(&config.embedding, config.base_path())?;
        let snapshots = Arc::new(BackendLocal::new(config.index_path())?);

        let (service, report) = Self::with_parts(generator, snapshots, config.search.clone())?;
        log::info!(
            "Visual search ready: {} indices loaded, {} skipped",
            report.loaded.len(),
            report.skipped.len()
        );
        Ok(Arc::new(service))
    }

    /// Assemble the service from an initialized generator and a snapshot
    /// store, loading whatever snapshots the store holds.
    pub fn with_parts(
        generator: EmbeddingGenerator,
        snapshots: Arc<dyn StorageManager>,
        search_config: SearchConfig,
    ) -> Result<(Self, LoadReport), ServiceError> {
        let registry = IndexRegistry::new(generator.dimensions(), generator.model_id_hash());
        let report = registry.load_all(snapshots.as_ref())?;

        let service = Self {
            generator,
            registry,
            snapshots,
            search_config,
        };
        Ok((service, report))
    }

    pub fn generator(&self) -> &EmbeddingGenerator {
        &self.generator
    }

    pub fn registry(&self) -> &IndexRegistry {
        &self.registry
    }

    pub fn health(&self) -> ServiceHealth {
        ServiceHealth {
            model: self.generator.model_name().to_string(),
            dimensions: self.generator.dimensions(),
            tenants: self.registry.tenants().len(),
        }
    }

    /// Persist the tenant's index as its single snapshot.
    pub fn save_index(&self, tenant: &TenantId) -> Result<(), RegistryError> {
        self.registry.save(tenant, self.snapshots.as_ref())
    }

    /// Re-read the tenant's snapshot from storage.
    pub fn reload_index(&self, tenant: &TenantId) -> Result<bool, RegistryError> {
        self.registry.load(tenant, self.snapshots.as_ref())
    }

    /// Remove the tenant's index from memory and storage.
    pub fn evict_index(&self, tenant: &TenantId) -> Result<bool, RegistryError> {
        self.registry.evict(tenant, self.snapshots.as_ref())
    }

    pub fn index_stats(&self, tenant: &TenantId) -> Result<IndexStats, RegistryError> {
        self.registry.stats(tenant)
    }
}
