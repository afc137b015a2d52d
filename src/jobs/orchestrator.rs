use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::catalog::{self, CatalogClient, CatalogItem, CatalogProvider};
use crate::config::Config;
use crate::eid::Eid;
use crate::jobs::{Job, JobError};
use crate::ratelimit::{Clock, RateLimitConfig, RateLimiter, SystemClock};
use crate::semantic::{IndexStats, TenantSlot, VisualSearch};
use crate::store::{MetadataStore, ProductRecord, TenantRecord, TenantStatus};
use crate::tenant::TenantId;

/// What happened to one catalog item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Indexed,
    /// No image reference; not a failure.
    NoImage,
    /// Download or embedding failed; the item stays out of the index.
    Skipped(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub indexed: usize,
    pub without_image: usize,
    pub skipped: usize,
}

impl BatchOutcome {
    fn record(&mut self, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Indexed => self.indexed += 1,
            ItemOutcome::NoImage => self.without_image += 1,
            ItemOutcome::Skipped(_) => self.skipped += 1,
        }
    }

    fn merge(&mut self, other: &BatchOutcome) {
        self.indexed += other.indexed;
        self.without_image += other.without_image;
        self.skipped += other.skipped;
    }
}

/// Latest job and index size of one tenant.
#[derive(Debug, Clone, Serialize)]
pub struct TenantReport {
    pub tenant: TenantId,
    pub status: Option<TenantStatus>,
    pub latest_job: Option<Job>,
    pub index: Option<IndexStats>,
}

/// Exclusive right to run a job for one tenant. Released on drop.
#[derive(Debug)]
pub struct TenantClaim {
    tenant: TenantId,
    active: Arc<Mutex<HashSet<TenantId>>>,
}

impl TenantClaim {
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }
}

impl Drop for TenantClaim {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.tenant);
        }
    }
}

/// Drives indexing jobs from QUEUED to DONE or ERROR.
///
/// Pulls the tenant's catalog page by page under the upstream rate ceiling,
/// then embeds and upserts items in fixed-size batches with a pause between
/// batches. Failures of a single item are logged and skipped; anything else
/// fails the job with the error message recorded.
pub struct IndexingOrchestrator {
    search: Arc<VisualSearch>,
    store: Arc<dyn MetadataStore>,
    catalogs: Arc<dyn CatalogProvider>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    batch_interval: Duration,
    max_products: Option<usize>,
    pages_per_second: f64,
    active: Arc<Mutex<HashSet<TenantId>>>,
    /// Final states the store refused to persist, served in its place.
    unrecorded: Mutex<HashMap<Eid, Job>>,
}

impl IndexingOrchestrator {
    pub fn new(
        search: Arc<VisualSearch>,
        store: Arc<dyn MetadataStore>,
        catalogs: Arc<dyn CatalogProvider>,
        config: &Config,
    ) -> Self {
        Self {
            search,
            store,
            catalogs,
            clock: Arc::new(SystemClock),
            batch_size: config.indexing.batch_size.max(1),
            batch_interval: Duration::from_millis(config.indexing.batch_interval_ms),
            max_products: config.indexing.max_products,
            pages_per_second: config.catalog.pages_per_second,
            active: Arc::new(Mutex::new(HashSet::new())),
            unrecorded: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the clock behind every pause.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub fn search(&self) -> &Arc<VisualSearch> {
        &self.search
    }

    /// Register a tenant or refresh its credentials. Reactivates an
    /// uninstalled tenant.
    pub fn register_tenant(&self, tenant: TenantRecord) -> Result<(), JobError> {
        log::info!("Registering tenant {} ({})", tenant.id, tenant.shop_domain);
        self.store.upsert_tenant(tenant)?;
        Ok(())
    }

    /// Create a QUEUED job for an active tenant.
    pub fn submit(&self, tenant: &TenantId) -> Result<Job, JobError> {
        let record = self
            .store
            .get_tenant(tenant)?
            .ok_or_else(|| JobError::UnknownTenant(tenant.clone()))?;
        if record.status != TenantStatus::Active {
            return Err(JobError::TenantUninstalled(tenant.clone()));
        }

        let job = Job::queued(tenant.clone());
        self.store.save_job(&job)?;
        log::info!("Queued indexing job {} for tenant {}", job.id, tenant);
        Ok(job)
    }

    /// Current record of a job. A final state that could not be written to
    /// the store takes precedence over the stored one.
    pub fn job(&self, id: &Eid) -> Result<Job, JobError> {
        if let Some(job) = self.unrecorded()?.get(id) {
            return Ok(job.clone());
        }
        self.store
            .get_job(id)?
            .ok_or_else(|| JobError::NotFound(id.clone()))
    }

    /// Jobs in submission order, optionally for one tenant.
    pub fn jobs(&self, tenant: Option<&TenantId>) -> Result<Vec<Job>, JobError> {
        let unrecorded = self.unrecorded()?;
        Ok(self
            .store
            .list_jobs(tenant)?
            .into_iter()
            .map(|job| unrecorded.get(&job.id).cloned().unwrap_or(job))
            .collect())
    }

    fn unrecorded(&self) -> Result<MutexGuard<'_, HashMap<Eid, Job>>, JobError> {
        self.unrecorded
            .lock()
            .map_err(|e| JobError::Runner(format!("Lock poisoned: {}", e)))
    }

    /// Reserve `tenant` for one job. Fails while another claim is alive.
    pub fn claim(&self, tenant: &TenantId) -> Result<TenantClaim, JobError> {
        let mut active = self
            .active
            .lock()
            .map_err(|e| JobError::Runner(format!("Lock poisoned: {}", e)))?;
        if !active.insert(tenant.clone()) {
            return Err(JobError::AlreadyRunning(tenant.clone()));
        }
        Ok(TenantClaim {
            tenant: tenant.clone(),
            active: self.active.clone(),
        })
    }

    /// Run a QUEUED job to completion on the calling thread.
    pub fn run(&self, id: &Eid) -> Result<Job, JobError> {
        let job = self.job(id)?;
        let claim = self.claim(&job.tenant)?;
        self.run_claimed(id, &claim)
    }

    /// Like [`run`](Self::run), for a caller already holding the tenant's claim.
    ///
    /// Returns `Ok` with the final record whether the job ended DONE or
    /// ERROR. If DONE cannot be saved the job is recorded as ERROR instead.
    /// `Err` means the job could not be started, or no final state could be
    /// saved at all; the job then reads as ERROR through [`job`](Self::job)
    /// for the life of this orchestrator.
    pub fn run_claimed(&self, id: &Eid, claim: &TenantClaim) -> Result<Job, JobError> {
        let mut job = self.job(id)?;
        if &job.tenant != claim.tenant() {
            return Err(JobError::Runner(format!(
                "claim for {} cannot run job {} of tenant {}",
                claim.tenant(),
                job.id,
                job.tenant
            )));
        }

        job.start()?;
        self.store.save_job(&job)?;

        let span = tracing::info_span!("index_job", job = %job.id, tenant = %job.tenant);
        let _enter = span.enter();
        log::info!("Starting product indexing for tenant {}", job.tenant);

        match self.execute(&mut job) {
            Ok(outcome) => {
                let mut done = job.clone();
                done.complete()?;
                match self.store.save_job(&done) {
                    Ok(()) => {
                        log::info!(
                            "Completed job {}: {}/{} processed, {} indexed, {} skipped, {} without image",
                            done.id,
                            done.processed,
                            done.total,
                            outcome.indexed,
                            outcome.skipped,
                            outcome.without_image
                        );
                        return Ok(done);
                    }
                    Err(err) => {
                        log::error!("Could not record completion of job {}: {}", job.id, err);
                        job.fail(format!(
                            "Indexing finished but the DONE state could not be recorded: {err}"
                        ))?;
                    }
                }
            }
            Err(err) => {
                log::error!("Indexing job {} failed: {}", job.id, err);
                job.fail(err.to_string())?;
            }
        }

        self.record_failure(job)
    }

    fn record_failure(&self, job: Job) -> Result<Job, JobError> {
        match self.store.save_job(&job) {
            Ok(()) => Ok(job),
            Err(err) => {
                log::error!(
                    "Could not record failure of job {}, keeping it in memory: {}",
                    job.id,
                    err
                );
                self.unrecorded()?.insert(job.id.clone(), job);
                Err(err.into())
            }
        }
    }

    fn execute(&self, job: &mut Job) -> Result<BatchOutcome, JobError> {
        let tenant = self
            .store
            .get_tenant(&job.tenant)?
            .ok_or_else(|| JobError::UnknownTenant(job.tenant.clone()))?;
        if tenant.status != TenantStatus::Active {
            return Err(JobError::TenantUninstalled(job.tenant.clone()));
        }

        let client = self.catalogs.client_for(&tenant)?;
        client.validate_credential()?;

        let page_limiter = RateLimiter::new(
            RateLimitConfig::per_second(self.pages_per_second),
            self.clock.clone(),
        );
        let items = catalog::fetch_all(client.as_ref(), &page_limiter, self.max_products)?;

        job.set_total(items.len())?;
        self.store.save_job(job)?;

        // Created even for an empty catalog, so searches find an empty index.
        let slot = self.search.registry().get_or_create(&job.tenant)?;

        let batch_limiter =
            RateLimiter::new(RateLimitConfig::every(self.batch_interval), self.clock.clone());
        let mut outcome = BatchOutcome::default();

        for batch in items.chunks(self.batch_size) {
            batch_limiter.acquire();

            let batch_outcome = self.process_batch(&job.tenant, client.as_ref(), &slot, batch)?;
            outcome.merge(&batch_outcome);

            job.advance(batch.len())?;
            self.store.save_job(job)?;
            log::info!(
                "Processed {}/{} products for tenant {}",
                job.processed,
                job.total,
                job.tenant
            );
        }

        self.search.save_index(&job.tenant)?;
        Ok(outcome)
    }

    fn process_batch(
        &self,
        tenant: &TenantId,
        client: &dyn CatalogClient,
        slot: &TenantSlot,
        batch: &[CatalogItem],
    ) -> Result<BatchOutcome, JobError> {
        let indexed_at = Utc::now();
        let records = batch
            .iter()
            .filter_map(|item| {
                item.image_url.as_ref().map(|url| ProductRecord {
                    tenant: tenant.clone(),
                    item_id: item.item_id.clone(),
                    title: item.title.clone(),
                    handle: item.handle.clone(),
                    image_url: url.clone(),
                    indexed_at,
                })
            })
            .collect::<Vec<_>>();
        self.store.upsert_products(records)?;

        let mut outcome = BatchOutcome::default();
        for item in batch {
            let item_outcome = self.process_item(client, slot, item)?;
            if let ItemOutcome::Skipped(reason) = &item_outcome {
                log::warn!("Skipping product {}: {}", item.item_id, reason);
            }
            outcome.record(&item_outcome);
        }
        Ok(outcome)
    }

    /// Download, embed and upsert one item whose metadata is already stored.
    ///
    /// Download and embedding failures are the item's own and come back as
    /// [`ItemOutcome::Skipped`]. Index failures are returned as errors and
    /// end the job.
    fn process_item(
        &self,
        client: &dyn CatalogClient,
        slot: &TenantSlot,
        item: &CatalogItem,
    ) -> Result<ItemOutcome, JobError> {
        let Some(image_url) = item.image_url.as_deref() else {
            return Ok(ItemOutcome::NoImage);
        };

        let bytes = match client.download_image(image_url) {
            Ok(bytes) => bytes,
            Err(err) => return Ok(ItemOutcome::Skipped(err.to_string())),
        };

        let embedding = match self.search.generator().embed(&bytes) {
            Ok(embedding) => embedding,
            Err(err) => return Ok(ItemOutcome::Skipped(err.to_string())),
        };

        slot.write()?.upsert(item.item_id.as_str(), embedding)?;
        log::debug!("Indexed product {}: {}", item.item_id, item.title);
        Ok(ItemOutcome::Indexed)
    }

    /// Jobs left RUNNING by a previous process. They are reported, not
    /// resumed or failed.
    pub fn stale_jobs(&self) -> Result<Vec<Job>, JobError> {
        let running = self.store.running_jobs()?;
        let unrecorded = self.unrecorded()?;
        let active = self
            .active
            .lock()
            .map_err(|e| JobError::Runner(format!("Lock poisoned: {}", e)))?;

        let stale: Vec<Job> = running
            .into_iter()
            .filter(|job| !active.contains(&job.tenant) && !unrecorded.contains_key(&job.id))
            .collect();
        for job in &stale {
            log::warn!(
                "Job {} for tenant {} was left RUNNING at {}/{}",
                job.id,
                job.tenant,
                job.processed,
                job.total
            );
        }
        Ok(stale)
    }

    /// Mark the tenant uninstalled and drop its index. Product records stay.
    pub fn uninstall(&self, tenant: &TenantId) -> Result<bool, JobError> {
        self.store
            .set_tenant_status(tenant, TenantStatus::Uninstalled)?;
        let evicted = self.search.evict_index(tenant)?;
        log::info!("Uninstalled tenant {tenant} (index removed: {evicted})");
        Ok(evicted)
    }

    pub fn report(&self, tenant: &TenantId) -> Result<TenantReport, JobError> {
        let status = self.store.get_tenant(tenant)?.map(|t| t.status);
        let latest_job = self.jobs(Some(tenant))?.pop();
        let index = if self.search.registry().contains(tenant) {
            Some(self.search.index_stats(tenant)?)
        } else {
            None
        };

        Ok(TenantReport {
            tenant: tenant.clone(),
            status,
            latest_job,
            index,
        })
    }
}
