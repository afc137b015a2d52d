//! Visual similarity search over per-tenant product image indices.
//!
//! # Architecture
//!
//! - `embeddings`: image encoders (fastembed vision models, colour histogram)
//! - `preprocess`: image validation, decoding and scaling
//! - `index`: in-memory exact inner-product index for one tenant
//! - `snapshot`: binary persistence format for a tenant index
//! - `registry`: process-wide tenant → index map with load/save/evict
//! - `service`: the long-lived service object owning model and registry
//! - `search`: the query path

pub mod embeddings;
mod index;
mod preprocess;
mod registry;
mod search;
mod service;
mod snapshot;

pub use embeddings::{EmbeddingError, EmbeddingGenerator, FastembedEncoder, HistogramEncoder, ImageEncoder};
pub use index::{IndexError, SearchResult, TenantIndex};
pub use preprocess::{prepare_image, PreparedImage};
pub use registry::{snapshot_name, IndexRegistry, IndexStats, LoadReport, RegistryError, TenantSlot};
pub use search::{SearchError, SearchRequest, SearchResponse};
pub use service::{ServiceError, ServiceHealth, VisualSearch};
pub use snapshot::SnapshotError;
