//! Durable records for tenants, indexed products and indexing jobs.
//!
//! [`MetadataStore`] is the seam: [`InMemoryStore`] backs tests and
//! one-shot runs, [`JsonStore`] keeps the same data in JSON files.

mod json;
mod memory;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::eid::Eid;
use crate::jobs::{Job, JobStatus};
use crate::tenant::TenantId;

pub use json::JsonStore;
pub use memory::InMemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed {file}: {source}")]
    Malformed {
        file: String,
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Tenant {0} not found")]
    TenantNotFound(TenantId),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Uninstalled,
}

/// A store that installed the app, with the credential used for its catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantRecord {
    pub id: TenantId,
    pub shop_domain: String,
    pub access_token: String,
    pub installed_at: DateTime<Utc>,
    pub status: TenantStatus,
}

impl TenantRecord {
    pub fn active(id: TenantId, shop_domain: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            id,
            shop_domain: shop_domain.into(),
            access_token: access_token.into(),
            installed_at: Utc::now(),
            status: TenantStatus::Active,
        }
    }
}

/// Catalog metadata of one indexed product. Unique per (tenant, item_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub tenant: TenantId,
    pub item_id: String,
    pub title: String,
    pub handle: String,
    pub image_url: String,
    pub indexed_at: DateTime<Utc>,
}

pub trait MetadataStore: Send + Sync {
    /// Insert the tenant, or replace its credentials and status.
    fn upsert_tenant(&self, tenant: TenantRecord) -> Result<(), StoreError>;
    fn get_tenant(&self, id: &TenantId) -> Result<Option<TenantRecord>, StoreError>;
    fn set_tenant_status(&self, id: &TenantId, status: TenantStatus) -> Result<(), StoreError>;

    /// Insert the product, or overwrite the stored fields of the same
    /// (tenant, item_id).
    fn upsert_product(&self, product: ProductRecord) -> Result<(), StoreError>;

    /// Upsert a batch of products. Stores with a per-write cost override
    /// this to pay it once per batch.
    fn upsert_products(&self, products: Vec<ProductRecord>) -> Result<(), StoreError> {
        products
            .into_iter()
            .try_for_each(|product| self.upsert_product(product))
    }

    fn list_products(&self, tenant: &TenantId) -> Result<Vec<ProductRecord>, StoreError>;

    /// Insert or replace the job under its id.
    fn save_job(&self, job: &Job) -> Result<(), StoreError>;
    fn get_job(&self, id: &Eid) -> Result<Option<Job>, StoreError>;
    /// Jobs in submission order, optionally only those of one tenant.
    fn list_jobs(&self, tenant: Option<&TenantId>) -> Result<Vec<Job>, StoreError>;

    fn latest_job(&self, tenant: &TenantId) -> Result<Option<Job>, StoreError> {
        Ok(self.list_jobs(Some(tenant))?.pop())
    }

    fn running_jobs(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .list_jobs(None)?
            .into_iter()
            .filter(|job| job.status == JobStatus::Running)
            .collect())
    }
}

type ProductShard = BTreeMap<String, ProductRecord>;

/// Shared in-memory state behind both store implementations.
///
/// Mutations are computed as updated copies (`with_*`) and committed by the
/// caller, so a store can persist the copy first and only then swap it in.
#[derive(Debug, Default)]
struct StoreState {
    tenants: BTreeMap<TenantId, TenantRecord>,
    /// Per tenant, keyed by item id.
    products: BTreeMap<TenantId, ProductShard>,
    /// In submission order.
    jobs: Vec<Job>,
}

impl StoreState {
    fn with_tenant(&self, tenant: TenantRecord) -> BTreeMap<TenantId, TenantRecord> {
        let mut tenants = self.tenants.clone();
        tenants.insert(tenant.id.clone(), tenant);
        tenants
    }

    fn with_tenant_status(
        &self,
        id: &TenantId,
        status: TenantStatus,
    ) -> Result<BTreeMap<TenantId, TenantRecord>, StoreError> {
        let mut tenants = self.tenants.clone();
        tenants
            .get_mut(id)
            .ok_or_else(|| StoreError::TenantNotFound(id.clone()))?
            .status = status;
        Ok(tenants)
    }

    /// The tenant's shard with `products` upserted. All must belong to `tenant`.
    fn with_products(&self, tenant: &TenantId, products: Vec<ProductRecord>) -> ProductShard {
        let mut shard = self.products.get(tenant).cloned().unwrap_or_default();
        for product in products {
            shard.insert(product.item_id.clone(), product);
        }
        shard
    }

    fn list_products(&self, tenant: &TenantId) -> Vec<ProductRecord> {
        self.products
            .get(tenant)
            .map(|shard| shard.values().cloned().collect())
            .unwrap_or_default()
    }

    fn with_job(&self, job: &Job) -> Vec<Job> {
        let mut jobs = self.jobs.clone();
        match jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => *existing = job.clone(),
            None => jobs.push(job.clone()),
        }
        jobs
    }

    fn get_job(&self, id: &Eid) -> Option<Job> {
        self.jobs.iter().find(|j| &j.id == id).cloned()
    }

    fn list_jobs(&self, tenant: Option<&TenantId>) -> Vec<Job> {
        self.jobs
            .iter()
            .filter(|job| tenant.map_or(true, |t| &job.tenant == t))
            .cloned()
            .collect()
    }
}

/// Split a batch by tenant, keeping each tenant's records in order.
fn by_tenant(products: Vec<ProductRecord>) -> BTreeMap<TenantId, Vec<ProductRecord>> {
    let mut grouped: BTreeMap<TenantId, Vec<ProductRecord>> = BTreeMap::new();
    for product in products {
        grouped.entry(product.tenant.clone()).or_default().push(product);
    }
    grouped
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> StoreError {
    StoreError::Internal(format!("Lock poisoned: {}", e))
}
