//! Bulk indexing jobs.
//!
//! - `job`: the job record and its state machine
//! - `orchestrator`: catalog fetch → batched embed/upsert → progress
//! - `runner`: inline and threaded execution behind [`JobRunner`]

mod job;
mod orchestrator;
mod runner;

pub use job::{Job, JobStatus, TransitionError};
pub use orchestrator::{BatchOutcome, IndexingOrchestrator, ItemOutcome, TenantClaim, TenantReport};
pub use runner::{InlineRunner, JobRunner, ThreadedRunner};

use crate::catalog::CatalogError;
use crate::eid::Eid;
use crate::semantic::{IndexError, RegistryError};
use crate::store::StoreError;
use crate::tenant::TenantId;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Tenant {0} is not registered")]
    UnknownTenant(TenantId),

    #[error("Tenant {0} is uninstalled")]
    TenantUninstalled(TenantId),

    #[error("Job {0} not found")]
    NotFound(Eid),

    #[error("Tenant {0} already has a running job")]
    AlreadyRunning(TenantId),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Runner error: {0}")]
    Runner(String),
}
