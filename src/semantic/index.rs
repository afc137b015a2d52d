//! Exact inner-product index for one tenant.
//!
//! Stores L2-normalized product embeddings keyed by catalog item id, so the
//! inner product equals cosine similarity.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::Serialize;

/// Search result from a tenant index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    /// Catalog item id
    pub id: String,
    /// Inner-product score, always > 0
    pub score: f32,
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Cannot store or search with zero-norm vector")]
    ZeroNormVector,

    #[error("Vector contains non-finite values")]
    NonFinite,
}

/// In-memory vector index for one tenant.
#[derive(Debug, Clone)]
pub struct TenantIndex {
    /// Item ID -> embedding
    entries: HashMap<String, Vec<f32>>,
    /// Expected embedding dimensions
    dimensions: usize,
}

impl TenantIndex {
    /// Create a new empty index with specified dimensions.
    pub fn new(dimensions: usize) -> Self {
        Self {
            entries: HashMap::new(),
            dimensions,
        }
    }

    /// Create an index with pre-allocated capacity.
    pub fn with_capacity(dimensions: usize, capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            dimensions,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace the vector stored under `id`.
    pub fn upsert(&mut self, id: impl Into<String>, embedding: Vec<f32>) -> Result<(), IndexError> {
        self.check_vector(&embedding)?;
        self.entries.insert(id.into(), embedding);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&[f32]> {
        self.entries.get(id).map(|v| v.as_slice())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn delete(&mut self, id: &str) -> Option<Vec<f32>> {
        self.entries.remove(id)
    }

    /// Drop every entry.
    pub fn remove(&mut self) {
        self.entries.clear();
    }

    /// Iterate over all entries in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[f32])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Top-`k` entries by inner product with `query`, highest first.
    ///
    /// Entries scoring `<= 0` are never returned, so the result may be
    /// shorter than `min(k, len)`. Equal scores are ordered by id.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>, IndexError> {
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }

        if k == 0 || self.entries.is_empty() {
            return Ok(vec![]);
        }

        let mut results: Vec<SearchResult> = self
            .entries
            .iter()
            .filter_map(|(id, embedding)| {
                let score = dot(query, embedding);
                (score > 0.0).then(|| SearchResult {
                    id: id.clone(),
                    score,
                })
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        results.truncate(k);

        Ok(results)
    }

    fn check_vector(&self, embedding: &[f32]) -> Result<(), IndexError> {
        if embedding.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: embedding.len(),
            });
        }
        if embedding.iter().any(|x| !x.is_finite()) {
            return Err(IndexError::NonFinite);
        }
        if embedding.iter().map(|x| x * x).sum::<f32>().sqrt() < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }
        Ok(())
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
