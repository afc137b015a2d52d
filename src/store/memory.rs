use std::sync::Mutex;

use crate::eid::Eid;
use crate::jobs::Job;
use crate::store::{
    by_tenant, poisoned, MetadataStore, ProductRecord, StoreError, StoreState, TenantRecord, TenantStatus,
};
use crate::tenant::TenantId;

/// Process-local store. Everything is lost on exit.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for InMemoryStore {
    fn upsert_tenant(&self, tenant: TenantRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().map_err(poisoned)?;
        state.tenants = state.with_tenant(tenant);
        Ok(())
    }

    fn get_tenant(&self, id: &TenantId) -> Result<Option<TenantRecord>, StoreError> {
        let state = self.state.lock().map_err(poisoned)?;
        Ok(state.tenants.get(id).cloned())
    }

    fn set_tenant_status(&self, id: &TenantId, status: TenantStatus) -> Result<(), StoreError> {
        let mut state = self.state.lock().map_err(poisoned)?;
        state.tenants = state.with_tenant_status(id, status)?;
        Ok(())
    }

    fn upsert_product(&self, product: ProductRecord) -> Result<(), StoreError> {
        self.upsert_products(vec![product])
    }

    fn upsert_products(&self, products: Vec<ProductRecord>) -> Result<(), StoreError> {
        let mut state = self.state.lock().map_err(poisoned)?;
        for (tenant, products) in by_tenant(products) {
            let shard = state.with_products(&tenant, products);
            state.products.insert(tenant, shard);
        }
        Ok(())
    }

    fn list_products(&self, tenant: &TenantId) -> Result<Vec<ProductRecord>, StoreError> {
        Ok(self.state.lock().map_err(poisoned)?.list_products(tenant))
    }

    fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut state = self.state.lock().map_err(poisoned)?;
        state.jobs = state.with_job(job);
        Ok(())
    }

    fn get_job(&self, id: &Eid) -> Result<Option<Job>, StoreError> {
        Ok(self.state.lock().map_err(poisoned)?.get_job(id))
    }

    fn list_jobs(&self, tenant: Option<&TenantId>) -> Result<Vec<Job>, StoreError> {
        Ok(self.state.lock().map_err(poisoned)?.list_jobs(tenant))
    }
}
