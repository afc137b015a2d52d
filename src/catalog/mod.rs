//! Remote product catalog access.
//!
//! A [`CatalogClient`] pages through one tenant's products and downloads
//! their images. [`fetch_all`] walks every page under the upstream page-rate
//! ceiling.

pub mod shopify;

use serde::{Deserialize, Serialize};

use crate::ratelimit::RateLimiter;
use crate::store::TenantRecord;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Catalog authentication failed: {0}")]
    Auth(String),

    #[error("Catalog fetch failed: {0}")]
    Fetch(String),

    #[error("Image download failed: {0}")]
    Download(String),

    #[error("Catalog has more than {0} products (indexing.max_products)")]
    TooLarge(usize),
}

/// One product as reported by the catalog. Only the first image is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub item_id: String,
    pub title: String,
    pub handle: String,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CatalogPage {
    pub items: Vec<CatalogItem>,
    /// Opaque cursor for the next page; `None` on the last one.
    pub next_cursor: Option<String>,
}

pub trait CatalogClient: Send + Sync {
    /// Check the tenant's credential against the remote API.
    fn validate_credential(&self) -> Result<(), CatalogError>;

    fn fetch_page(&self, cursor: Option<&str>) -> Result<CatalogPage, CatalogError>;

    /// Download image bytes. Fails on non-2xx responses and non-image content.
    fn download_image(&self, url: &str) -> Result<Vec<u8>, CatalogError>;
}

/// Builds a client bound to one tenant's credentials.
pub trait CatalogProvider: Send + Sync {
    fn client_for(&self, tenant: &TenantRecord) -> Result<Box<dyn CatalogClient>, CatalogError>;
}

/// Collect every item of the catalog.
///
/// Each page request first takes a permit from `limiter`, so consecutive
/// pages respect the upstream rate ceiling. An empty page ends the walk
/// even if the remote claims there is more. When `max_items` is set, a
/// catalog larger than it is rejected rather than cut short.
pub fn fetch_all(
    client: &dyn CatalogClient,
    limiter: &RateLimiter,
    max_items: Option<usize>,
) -> Result<Vec<CatalogItem>, CatalogError> {
    let mut items = Vec::new();
    let mut cursor: Option<String> = None;

    loop {
        limiter.acquire();
        let page = client.fetch_page(cursor.as_deref())?;
        if page.items.is_empty() {
            break;
        }

        items.extend(page.items);
        log::info!("Fetched catalog page (total: {})", items.len());

        if let Some(max) = max_items.filter(|max| items.len() > *max) {
            log::warn!("Catalog exceeds {max} products, giving up");
            return Err(CatalogError::TooLarge(max));
        }

        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    Ok(items)
}
