mod model_resolver;
mod postprocess;
mod preprocess;

pub mod config;
pub mod detection;
pub mod model_service;
pub mod ort_service;

pub use config::{ModelConfig, ModelKind};
pub use detection::{
    resize_results, Detection, DisplaySize, Expression, Expressions, FaceBox, Gender,
};
pub use model_service::{FaceAnalyzer, InferenceError, ModelLoadError, ModelLoader};
pub use ort_service::{OrtFaceAnalyzer, OrtModelLoader};
