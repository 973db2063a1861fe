use crate::config::ModelKind;
use crate::detection::Detection;
use image::RgbImage;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("Invalid model configuration: {0}")]
    InvalidConfig(String),
    #[error("Model {kind} not found at {path:?}")]
    NotFound { kind: ModelKind, path: PathBuf },
    #[error("Failed to fetch model {kind} from {url}: {reason}")]
    Fetch {
        kind: ModelKind,
        url: String,
        reason: String,
    },
    #[error("Failed to cache model {kind} at {path:?}: {source}")]
    Cache {
        kind: ModelKind,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Could not determine a cache directory for downloaded models")]
    NoCacheDir,
    #[error("Failed to build inference session for {kind}: {reason}")]
    Session { kind: ModelKind, reason: String },
}

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Failed to build input tensor: {0}")]
    Tensor(String),
    #[error("Inference failed on {kind}: {reason}")]
    Runtime { kind: ModelKind, reason: String },
    #[error("Unexpected output from {kind}: {reason}")]
    Output { kind: ModelKind, reason: String },
    #[error("Session lock poisoned for {0}")]
    Poisoned(ModelKind),
}

/// Runs the full face analysis stack over one RGB frame.
///
/// Returned boxes are in the pixel space of `frame`.
pub trait FaceAnalyzer: Send + Sync + 'static {
    fn analyze(&self, frame: &RgbImage) -> Result<Vec<Detection>, InferenceError>;
}

/// Produces a ready analyzer. Loading may block on disk or network I/O.
pub trait ModelLoader: Send + 'static {
    type Analyzer: FaceAnalyzer;

    fn load(&self) -> Result<Self::Analyzer, ModelLoadError>;
}
