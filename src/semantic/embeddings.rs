//! Image embedding generation.
//!
//! - `ImageEncoder`: a loaded model turning a prepared image into raw features
//! - `FastembedEncoder`: pretrained CLIP/ResNet/Unicom encoders via fastembed
//! - `HistogramEncoder`: model-free RGB colour histogram, for offline use
//! - `EmbeddingGenerator`: validation, preprocessing and L2 normalization

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Mutex};
use std::time::Duration;

use fastembed::{ImageEmbedding, ImageInitOptions};
use image::ImageFormat;

use crate::config::EmbeddingConfig;
use crate::semantic::preprocess::{prepare_image, PreparedImage};

/// Shortest-side input size of the CLIP-family encoders
const ENCODER_INPUT_SIZE: u32 = 224;

const HISTOGRAM_PREFIX: &str = "rgb-histogram-";

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    Initialization(String),

    #[error("Model download timed out after {0} seconds")]
    DownloadTimeout(u64),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),

    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Embedding generation failed: {0}")]
    Inference(String),
}

impl EmbeddingError {
    /// True for failures that happen while loading the model.
    pub fn is_initialization(&self) -> bool {
        matches!(
            self,
            EmbeddingError::Initialization(_)
                | EmbeddingError::DownloadTimeout(_)
                | EmbeddingError::InvalidModel(_)
        )
    }
}

/// A loaded image model. Implementations must be safe to call from many
/// threads at once; they serialize internally if the backend needs it.
pub trait ImageEncoder: Send + Sync {
    fn name(&self) -> &str;
    fn dimensions(&self) -> usize;
    /// Raw (not necessarily normalized) features for one image.
    fn encode(&self, image: &PreparedImage) -> Result<Vec<f32>, EmbeddingError>;
}

/// Wrapper around fastembed's ImageEmbedding model.
/// Uses a Mutex because fastembed's embed calls require &mut self.
pub struct FastembedEncoder {
    model: Mutex<ImageEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl FastembedEncoder {
    /// Load (downloading on first use) the named model into `cache_dir/models`.
    pub fn new(
        model_name: &str,
        cache_dir: &Path,
        download_timeout: Duration,
    ) -> Result<Self, EmbeddingError> {
        let (model_enum, dimensions) = Self::parse_model_name(model_name)?;

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::Initialization(format!("Failed to create models directory: {}", e))
        })?;

        let model = Self::load_with_timeout(model_enum, models_dir, download_timeout)?;

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            dimensions,
        })
    }

    /// Model loading may download weights; bound it so a stalled download
    /// fails startup instead of hanging it.
    fn load_with_timeout(
        model: fastembed::ImageEmbeddingModel,
        models_dir: PathBuf,
        timeout: Duration,
    ) -> Result<ImageEmbedding, EmbeddingError> {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let options = ImageInitOptions::new(model)
                .with_cache_dir(models_dir)
                .with_show_download_progress(true);
            let _ = tx.send(ImageEmbedding::try_new(options));
        });

        match rx.recv_timeout(timeout) {
            Ok(Ok(model)) => Ok(model),
            Ok(Err(e)) => Err(EmbeddingError::Initialization(e.to_string())),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                Err(EmbeddingError::DownloadTimeout(timeout.as_secs()))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(EmbeddingError::Initialization(
                "model loader thread exited".to_string(),
            )),
        }
    }

    /// Parse model name string to fastembed enum and its output dimension.
    fn parse_model_name(
        name: &str,
    ) -> Result<(fastembed::ImageEmbeddingModel, usize), EmbeddingError> {
        use fastembed::ImageEmbeddingModel as M;
        match name.to_lowercase().as_str() {
            "clip-vit-b-32" | "clipvitb32" => Ok((M::ClipVitB32, 512)),
            "resnet50" | "resnet-50" => Ok((M::Resnet50, 2048)),
            "unicom-vit-b-16" | "unicomvitb16" => Ok((M::UnicomVitB16, 768)),
            "unicom-vit-b-32" | "unicomvitb32" => Ok((M::UnicomVitB32, 512)),
            "nomic-embed-vision-v1.5" | "nomicembedvisionv15" => {
                Ok((M::NomicEmbedVisionV15, 768))
            }
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown model: {}. Supported models: clip-vit-b-32, resnet50, unicom-vit-b-16, unicom-vit-b-32, nomic-embed-vision-v1.5, {}<bins>",
                name, HISTOGRAM_PREFIX
            ))),
        }
    }
}

impl ImageEncoder for FastembedEncoder {
    fn name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn encode(&self, image: &PreparedImage) -> Result<Vec<f32>, EmbeddingError> {
        // fastembed decodes from bytes; hand it the already-scaled image
        let mut png = Vec::new();
        image
            .rgb
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|e| EmbeddingError::Inference(format!("failed to re-encode image: {e}")))?;

        let mut model = self.model.lock().map_err(|e| {
            EmbeddingError::Inference(format!("Failed to acquire model lock: {}", e))
        })?;

        let embeddings = model
            .embed_bytes(&[png.as_slice()], None)
            .map_err(|e| EmbeddingError::Inference(e.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Inference("No embedding returned".to_string()))
    }
}

/// Joint RGB histogram with `bins` levels per channel (`bins³` dimensions).
/// Cheap and fully deterministic; similarity reflects colour distribution only.
pub struct HistogramEncoder {
    name: String,
    bins: usize,
}

impl HistogramEncoder {
    pub fn new(bins: usize) -> Result<Self, EmbeddingError> {
        if !(2..=32).contains(&bins) {
            return Err(EmbeddingError::InvalidModel(format!(
                "histogram bins must be between 2 and 32, got {bins}"
            )));
        }
        Ok(Self {
            name: format!("{HISTOGRAM_PREFIX}{bins}"),
            bins,
        })
    }

    fn parse(name: &str) -> Option<Result<Self, EmbeddingError>> {
        let bins = name.to_lowercase().strip_prefix(HISTOGRAM_PREFIX)?.parse().ok()?;
        Some(Self::new(bins))
    }
}

impl ImageEncoder for HistogramEncoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> usize {
        self.bins * self.bins * self.bins
    }

    fn encode(&self, image: &PreparedImage) -> Result<Vec<f32>, EmbeddingError> {
        let b = self.bins;
        let mut hist = vec![0f32; self.dimensions()];
        for pixel in image.rgb.pixels() {
            let [r, g, bl] = pixel.0;
            let q = |c: u8| c as usize * b / 256;
            hist[q(r) * b * b + q(g) * b + q(bl)] += 1.0;
        }
        Ok(hist)
    }
}

/// Turns image bytes into unit-length embeddings of a fixed dimension.
pub struct EmbeddingGenerator {
    encoder: Box<dyn ImageEncoder>,
    dimensions: usize,
    max_image_bytes: usize,
}

impl std::fmt::Debug for EmbeddingGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingGenerator")
            .field("model", &self.encoder.name())
            .field("dimensions", &self.dimensions)
            .finish()
    }
}

impl EmbeddingGenerator {
    /// Load the configured model. Must succeed before any `embed` call.
    pub fn initialize(config: &EmbeddingConfig, cache_dir: &Path) -> Result<Self, EmbeddingError> {
        log::info!("Initializing image encoder '{}'", config.model);

        let encoder: Box<dyn ImageEncoder> = match HistogramEncoder::parse(&config.model) {
            Some(histogram) => Box::new(histogram?),
            None => Box::new(FastembedEncoder::new(
                &config.model,
                cache_dir,
                Duration::from_secs(config.download_timeout_secs),
            )?),
        };

        Self::with_encoder(encoder, config)
    }

    /// Wrap an already-loaded encoder. Its output dimension must match the
    /// configured one.
    pub fn with_encoder(
        encoder: Box<dyn ImageEncoder>,
        config: &EmbeddingConfig,
    ) -> Result<Self, EmbeddingError> {
        if encoder.dimensions() != config.dimensions {
            return Err(EmbeddingError::Initialization(format!(
                "model '{}' produces {} dimensions, configured dimension is {}",
                encoder.name(),
                encoder.dimensions(),
                config.dimensions
            )));
        }

        Ok(Self {
            encoder,
            dimensions: config.dimensions,
            max_image_bytes: config.max_image_bytes,
        })
    }

    pub fn model_name(&self) -> &str {
        self.encoder.name()
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Decode, scale, encode and L2-normalize one image.
    pub fn embed(&self, image_bytes: &[u8]) -> Result<Vec<f32>, EmbeddingError> {
        let prepared = prepare_image(image_bytes, self.max_image_bytes, ENCODER_INPUT_SIZE)?;

        let mut embedding = self.encoder.encode(&prepared)?;
        if embedding.len() != self.dimensions {
            return Err(EmbeddingError::Inference(format!(
                "encoder returned {} values, expected {}",
                embedding.len(),
                self.dimensions
            )));
        }

        l2_normalize(&mut embedding)?;
        Ok(embedding)
    }

    /// Compute SHA256 hash of the model name for snapshot identification.
    pub fn model_id_hash(&self) -> [u8; 32] {
        model_id_hash(self.encoder.name())
    }
}

pub fn model_id_hash(model_name: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(model_name.as_bytes());
    hasher.finalize().into()
}

/// Scale `v` to unit length in place.
pub fn l2_normalize(v: &mut [f32]) -> Result<(), EmbeddingError> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if !norm.is_finite() || norm < f32::EPSILON {
        return Err(EmbeddingError::Inference(
            "encoder produced a zero or non-finite vector".to_string(),
        ));
    }
    v.iter_mut().for_each(|x| *x /= norm);
    Ok(())
}
