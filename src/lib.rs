//! Multi-tenant visual similarity search.
//!
//! Product images become unit-length embeddings; each tenant gets its own
//! exact inner-product index, filled by bulk indexing jobs that page through
//! the tenant's catalog and queried with an image.

pub mod catalog;
pub mod config;
pub mod eid;
pub mod jobs;
pub mod ratelimit;
pub mod semantic;
pub mod storage;
pub mod store;
pub mod tenant;

#[cfg(test)]
mod tests;
