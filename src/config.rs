use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::storage::{self, StorageManager};

const CONFIG_FILE: &str = "config.yaml";

/// Default image encoder (CLIP ViT-B/32, 512-dim output)
const DEFAULT_EMBEDDING_MODEL: &str = "clip-vit-b-32";
const DEFAULT_EMBEDDING_DIMENSIONS: usize = 512;
/// Images larger than this are rejected before decoding (8 MiB)
const DEFAULT_MAX_IMAGE_BYTES: usize = 8 * 1024 * 1024;
/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;

const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_BATCH_INTERVAL_MS: u64 = 1000;

const DEFAULT_API_VERSION: &str = "2023-10";
/// Shopify caps `limit` at 250 per page
const DEFAULT_PAGE_LIMIT: u32 = 250;
const DEFAULT_PAGES_PER_SECOND: f64 = 2.0;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const DEFAULT_SEARCH_LIMIT: usize = 24;
const DEFAULT_MAX_SEARCH_LIMIT: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config is malformed: {0}")]
    Malformed(#[from] serde_yml::Error),

    #[error("config file is not valid utf8")]
    NotUtf8,

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Image encoder settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingConfig {
    /// Encoder name (e.g., "clip-vit-b-32")
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Output dimension D shared by every tenant index
    #[serde(default = "default_embedding_dimensions")]
    pub dimensions: usize,

    /// Upper bound on accepted image payloads, in bytes
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,

    /// Timeout for model download in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
        }
    }
}

/// Bulk indexing job settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IndexingConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Minimum spacing between batch starts, in milliseconds
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,

    /// Optional ceiling on catalog size. A larger catalog fails the job
    /// instead of being indexed partially. Unset means no ceiling.
    #[serde(default)]
    pub max_products: Option<usize>,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_interval_ms: DEFAULT_BATCH_INTERVAL_MS,
            max_products: None,
        }
    }
}

/// Upstream catalog (Shopify Admin API) settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CatalogConfig {
    #[serde(default = "default_api_version")]
    pub api_version: String,

    #[serde(default = "default_page_limit")]
    pub page_limit: u32,

    /// Upstream page-rate ceiling
    #[serde(default = "default_pages_per_second")]
    pub pages_per_second: f64,

    /// Timeout applied to every outbound request, in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            api_version: DEFAULT_API_VERSION.to_string(),
            page_limit: DEFAULT_PAGE_LIMIT,
            pages_per_second: DEFAULT_PAGES_PER_SECOND,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SearchConfig {
    #[serde(default = "default_search_limit")]
    pub default_limit: usize,

    #[serde(default = "default_max_search_limit")]
    pub max_limit: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_SEARCH_LIMIT,
            max_limit: DEFAULT_MAX_SEARCH_LIMIT,
        }
    }
}

/// Locations of persisted state, relative to the data directory
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    #[serde(default = "default_index_dir")]
    pub index_dir: String,

    #[serde(default = "default_store_dir")]
    pub store_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            index_dir: default_index_dir(),
            store_dir: default_store_dir(),
        }
    }
}

fn default_embedding_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}

fn default_embedding_dimensions() -> usize {
    DEFAULT_EMBEDDING_DIMENSIONS
}

fn default_max_image_bytes() -> usize {
    DEFAULT_MAX_IMAGE_BYTES
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_batch_interval_ms() -> u64 {
    DEFAULT_BATCH_INTERVAL_MS
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

fn default_page_limit() -> u32 {
    DEFAULT_PAGE_LIMIT
}

fn default_pages_per_second() -> f64 {
    DEFAULT_PAGES_PER_SECOND
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_search_limit() -> usize {
    DEFAULT_SEARCH_LIMIT
}

fn default_max_search_limit() -> usize {
    DEFAULT_MAX_SEARCH_LIMIT
}

fn default_index_dir() -> String {
    "indices".to_string()
}

fn default_store_dir() -> String {
    "store".to_string()
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.embedding.dimensions == 0 || self.embedding.dimensions > u16::MAX as usize {
            return invalid(format!(
                "embedding.dimensions must be between 1 and {}, got {}",
                u16::MAX,
                self.embedding.dimensions
            ));
        }
        if self.embedding.max_image_bytes == 0 {
            return invalid("embedding.max_image_bytes must be greater than 0".into());
        }
        if self.embedding.download_timeout_secs == 0 {
            return invalid("embedding.download_timeout_secs must be greater than 0".into());
        }
        if self.indexing.batch_size == 0 {
            return invalid("indexing.batch_size must be greater than 0".into());
        }
        if self.indexing.max_products == Some(0) {
            return invalid("indexing.max_products must be greater than 0 when set".into());
        }
        if self.catalog.page_limit == 0 || self.catalog.page_limit > DEFAULT_PAGE_LIMIT {
            return invalid(format!(
                "catalog.page_limit must be between 1 and {DEFAULT_PAGE_LIMIT}, got {}",
                self.catalog.page_limit
            ));
        }
        if !(self.catalog.pages_per_second > 0.0) {
            return invalid(format!(
                "catalog.pages_per_second must be positive, got {}",
                self.catalog.pages_per_second
            ));
        }
        if self.catalog.request_timeout_secs == 0 {
            return invalid("catalog.request_timeout_secs must be greater than 0".into());
        }
        if self.search.default_limit == 0 || self.search.default_limit > self.search.max_limit {
            return invalid(format!(
                "search.default_limit must be between 1 and search.max_limit ({}), got {}",
                self.search.max_limit, self.search.default_limit
            ));
        }

        Ok(())
    }

    /// Load `config.yaml` from `base_path`, writing defaults if it is missing.
    pub fn load_with(base_path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let store = storage::BackendLocal::new(base_path.as_ref())?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            store.write(
                CONFIG_FILE,
                serde_yml::to_string(&Self::default())?.as_bytes(),
            )?;
        }

        let config_str =
            String::from_utf8(store.read(CONFIG_FILE)?).map_err(|_| ConfigError::NotUtf8)?;
        let mut config: Self = serde_yml::from_str(&config_str)?;

        config.base_path = base_path.as_ref().to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let store = storage::BackendLocal::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store.write(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn index_path(&self) -> PathBuf {
        self.base_path.join(&self.storage.index_dir)
    }

    pub fn store_path(&self) -> PathBuf {
        self.base_path.join(&self.storage.store_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_creates_default_file() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load_with(tmp.path()).unwrap();

        assert!(tmp.path().join(CONFIG_FILE).exists());
        assert_eq!(config.embedding.dimensions, 512);
        assert_eq!(config.embedding.max_image_bytes, 8 * 1024 * 1024);
        assert_eq!(config.indexing.batch_size, 10);
        assert_eq!(config.indexing.batch_interval_ms, 1000);
        assert_eq!(config.indexing.max_products, None);
        assert_eq!(config.catalog.request_timeout_secs, 30);
        assert_eq!(config.index_path(), tmp.path().join("indices"));
    }

    #[test]
    fn test_partial_file_gets_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILE),
            "indexing:\n  batch_size: 25\n",
        )
        .unwrap();

        let config = Config::load_with(tmp.path()).unwrap();
        assert_eq!(config.indexing.batch_size, 25);
        assert_eq!(config.indexing.batch_interval_ms, 1000);
        assert_eq!(config.catalog.api_version, "2023-10");

        // upgraded file now carries every field
        let saved = std::fs::read_to_string(tmp.path().join(CONFIG_FILE)).unwrap();
        assert!(saved.contains("pages_per_second"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILE),
            "indexing:\n  batch_size: 0\n",
        )
        .unwrap();

        let result = Config::load_with(tmp.path());
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_product_ceiling_is_opt_in() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILE),
            "indexing:\n  max_products: 20000\n",
        )
        .unwrap();
        let config = Config::load_with(tmp.path()).unwrap();
        assert_eq!(config.indexing.max_products, Some(20000));

        let mut config = Config::default();
        config.indexing.max_products = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_page_rate() {
        let mut config = Config::default();
        config.catalog.pages_per_second = 0.0;
        assert!(config.validate().is_err());

        config.catalog.pages_per_second = f64::NAN;
        assert!(config.validate().is_err());
    }
}
