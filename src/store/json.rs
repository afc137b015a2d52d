use std::path::Path;
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::eid::Eid;
use crate::jobs::Job;
use crate::storage::{BackendLocal, StorageManager};
use crate::store::{
    by_tenant, poisoned, MetadataStore, ProductRecord, StoreError, StoreState, TenantRecord, TenantStatus,
};
use crate::tenant::TenantId;

const TENANTS_FILE: &str = "tenants.json";
const PRODUCTS_PREFIX: &str = "products-";
const JOBS_FILE: &str = "jobs.json";

fn products_file(tenant: &TenantId) -> String {
    format!("{PRODUCTS_PREFIX}{tenant}.json")
}

/// File-backed store: tenants and jobs in one JSON array each, products in
/// one file per tenant.
///
/// Each mutation rewrites only the affected file through write-then-rename
/// while the state lock is held. The in-memory state changes only after the
/// write succeeded, so memory and disk never disagree.
pub struct JsonStore {
    state: Mutex<StoreState>,
    storage: Box<dyn StorageManager>,
}

impl JsonStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let storage = BackendLocal::new(dir)?;
        log::debug!("Opening store at {}", storage.base_dir.display());
        Self::with_storage(Box::new(storage))
    }

    /// Load every record file found in `storage`.
    pub fn with_storage(storage: Box<dyn StorageManager>) -> Result<Self, StoreError> {
        let mut state = StoreState::default();
        for tenant in read_file::<TenantRecord>(storage.as_ref(), TENANTS_FILE)? {
            state.tenants.insert(tenant.id.clone(), tenant);
        }

        let mut shards: Vec<String> = storage
            .list()
            .into_iter()
            .filter(|name| name.starts_with(PRODUCTS_PREFIX) && name.ends_with(".json"))
            .collect();
        shards.sort();
        for file in shards {
            let products = read_file::<ProductRecord>(storage.as_ref(), &file)?;
            for (tenant, products) in by_tenant(products) {
                let shard = state.with_products(&tenant, products);
                state.products.insert(tenant, shard);
            }
        }

        state.jobs = read_file::<Job>(storage.as_ref(), JOBS_FILE)?;

        log::debug!(
            "Loaded {} tenants, {} product files, {} jobs",
            state.tenants.len(),
            state.products.len(),
            state.jobs.len()
        );

        Ok(Self {
            state: Mutex::new(state),
            storage,
        })
    }

    fn write_file<'a, T: Serialize + 'a>(
        &self,
        file: &str,
        records: impl IntoIterator<Item = &'a T>,
    ) -> Result<(), StoreError> {
        let records: Vec<&T> = records.into_iter().collect();
        let data = serde_json::to_vec_pretty(&records)?;
        self.storage.write(file, &data)?;
        Ok(())
    }
}

fn read_file<T: DeserializeOwned>(storage: &dyn StorageManager, file: &str) -> Result<Vec<T>, StoreError> {
    if !storage.exists(file) {
        return Ok(vec![]);
    }
    let data = storage.read(file)?;
    serde_json::from_slice(&data).map_err(|source| StoreError::Malformed {
        file: file.to_string(),
        source,
    })
}

impl MetadataStore for JsonStore {
    fn upsert_tenant(&self, tenant: TenantRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().map_err(poisoned)?;
        let tenants = state.with_tenant(tenant);
        self.write_file(TENANTS_FILE, tenants.values())?;
        state.tenants = tenants;
        Ok(())
    }

    fn get_tenant(&self, id: &TenantId) -> Result<Option<TenantRecord>, StoreError> {
        let state = self.state.lock().map_err(poisoned)?;
        Ok(state.tenants.get(id).cloned())
    }

    fn set_tenant_status(&self, id: &TenantId, status: TenantStatus) -> Result<(), StoreError> {
        let mut state = self.state.lock().map_err(poisoned)?;
        let tenants = state.with_tenant_status(id, status)?;
        self.write_file(TENANTS_FILE, tenants.values())?;
        state.tenants = tenants;
        Ok(())
    }

    fn upsert_product(&self, product: ProductRecord) -> Result<(), StoreError> {
        self.upsert_products(vec![product])
    }

    /// One file write per tenant in the batch.
    fn upsert_products(&self, products: Vec<ProductRecord>) -> Result<(), StoreError> {
        let mut state = self.state.lock().map_err(poisoned)?;
        for (tenant, products) in by_tenant(products) {
            let shard = state.with_products(&tenant, products);
            self.write_file(&products_file(&tenant), shard.values())?;
            state.products.insert(tenant, shard);
        }
        Ok(())
    }

    fn list_products(&self, tenant: &TenantId) -> Result<Vec<ProductRecord>, StoreError> {
        Ok(self.state.lock().map_err(poisoned)?.list_products(tenant))
    }

    fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut state = self.state.lock().map_err(poisoned)?;
        let jobs = state.with_job(job);
        self.write_file(JOBS_FILE, &jobs)?;
        state.jobs = jobs;
        Ok(())
    }

    fn get_job(&self, id: &Eid) -> Result<Option<Job>, StoreError> {
        Ok(self.state.lock().map_err(poisoned)?.get_job(id))
    }

    fn list_jobs(&self, tenant: Option<&TenantId>) -> Result<Vec<Job>, StoreError> {
        Ok(self.state.lock().map_err(poisoned)?.list_jobs(tenant))
    }
}
