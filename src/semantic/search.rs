//! Query path: embed a query image and rank one tenant's index against it.

use std::time::Instant;

use serde::Serialize;

use crate::semantic::embeddings::EmbeddingError;
use crate::semantic::index::{IndexError, SearchResult};
use crate::semantic::registry::RegistryError;
use crate::semantic::service::VisualSearch;
use crate::tenant::TenantId;

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Tenant {0} has no index yet")]
    TenantNotInitialized(TenantId),

    #[error("Result limit must be at least 1")]
    InvalidLimit,

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub tenant: TenantId,
    pub image: Vec<u8>,
    /// Falls back to the configured default; capped at the configured max.
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub tenant: TenantId,
    pub results: Vec<SearchResult>,
    pub total: usize,
    pub latency_ms: u64,
}

impl VisualSearch {
    /// Top matches for `request.image` within the tenant's catalog.
    ///
    /// A tenant with no index is an error. A tenant whose index is empty
    /// gets an empty response without running the model.
    pub fn query(&self, request: &SearchRequest) -> Result<SearchResponse, SearchError> {
        let started = Instant::now();

        let limit = match request.limit {
            Some(0) => return Err(SearchError::InvalidLimit),
            Some(n) => n.min(self.search_config.max_limit),
            None => self.search_config.default_limit,
        };

        let slot = self
            .registry()
            .get(&request.tenant)?
            .ok_or_else(|| SearchError::TenantNotInitialized(request.tenant.clone()))?;

        let results = if slot.read()?.is_empty() {
            vec![]
        } else {
            // The model runs without holding the tenant lock.
            let embedding = self.generator().embed(&request.image)?;
            slot.read()?.search(&embedding, limit)?
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        log::debug!(
            "Search for tenant {}: {} results in {}ms",
            request.tenant,
            results.len(),
            latency_ms
        );

        Ok(SearchResponse {
            tenant: request.tenant.clone(),
            total: results.len(),
            results,
            latency_ms,
        })
    }
}
