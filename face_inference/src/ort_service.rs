use crate::{
    config::{ModelConfig, ModelKind},
    detection::{Detection, DisplaySize, Expressions, Gender},
    model_resolver,
    model_service::{FaceAnalyzer, InferenceError, ModelLoadError, ModelLoader},
    postprocess::{decode_detector_output, non_max_suppression, softmax},
    preprocess::{crop_face, to_input_tensor},
};
use image::RgbImage;
use ndarray::{Array, ArrayD, Ix4};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};
use std::{path::Path, sync::Mutex};
use tracing::instrument;

/// Face detector plus age/gender and expression estimators, each backed by
/// its own ONNX Runtime session.
pub struct OrtFaceAnalyzer {
    detector: Mutex<Session>,
    age_gender: Mutex<Session>,
    expression: Mutex<Session>,
    detector_input_size: u32,
    attribute_input_size: u32,
    min_confidence: f32,
    iou_threshold: f32,
}

impl OrtFaceAnalyzer {
    /// Loads the detector, then the age/gender model, then the expression
    /// model. The first failure aborts the load.
    pub fn load(config: &ModelConfig) -> Result<Self, ModelLoadError> {
        config.validate().map_err(ModelLoadError::InvalidConfig)?;
        if config.is_remote() {
            tracing::info!("Fetching models from {}", config.base);
        }

        let detector = load_session(config, ModelKind::FaceDetector)?;
        let age_gender = load_session(config, ModelKind::AgeGender)?;
        let expression = load_session(config, ModelKind::Expression)?;

        Ok(Self {
            detector: Mutex::new(detector),
            age_gender: Mutex::new(age_gender),
            expression: Mutex::new(expression),
            detector_input_size: config.detector_input_size,
            attribute_input_size: config.attribute_input_size,
            min_confidence: config.min_confidence,
            iou_threshold: config.iou_threshold,
        })
    }

    fn run_inference(
        session: &Mutex<Session>,
        kind: ModelKind,
        input: Array<f32, Ix4>,
    ) -> Result<Vec<ArrayD<f32>>, InferenceError> {
        let tensor =
            Tensor::from_array(input).map_err(|e| InferenceError::Tensor(e.to_string()))?;

        let mut session = session.lock().map_err(|_| InferenceError::Poisoned(kind))?;

        let outputs = session
            .run(ort::inputs![tensor])
            .map_err(|e| InferenceError::Runtime {
                kind,
                reason: e.to_string(),
            })?;

        let mut arrays = Vec::with_capacity(outputs.len());
        for index in 0..outputs.len() {
            let array = outputs[index]
                .try_extract_array::<f32>()
                .map_err(|e| InferenceError::Output {
                    kind,
                    reason: format!("failed to extract output {}: {}", index, e),
                })?;
            arrays.push(array.to_owned());
        }

        Ok(arrays)
    }

    fn estimate_age_gender(&self, face: &RgbImage) -> Result<(f32, Gender, f32), InferenceError> {
        let kind = ModelKind::AgeGender;
        let input = to_input_tensor(face, self.attribute_input_size);
        let outputs = Self::run_inference(&self.age_gender, kind, input)?;

        let [age_output, gender_output, ..] = outputs.as_slice() else {
            return Err(InferenceError::Output {
                kind,
                reason: format!("expected age and gender outputs, got {}", outputs.len()),
            });
        };

        let age = age_output
            .iter()
            .next()
            .copied()
            .ok_or_else(|| InferenceError::Output {
                kind,
                reason: "empty age output".into(),
            })?;

        let logits: Vec<f32> = gender_output.iter().copied().collect();
        let probabilities = softmax(&logits);
        let &[male, female] = probabilities.as_slice() else {
            return Err(InferenceError::Output {
                kind,
                reason: format!("expected 2 gender values, got {}", logits.len()),
            });
        };

        let (gender, probability) = if male >= female {
            (Gender::Male, male)
        } else {
            (Gender::Female, female)
        };

        Ok((age, gender, probability))
    }

    fn estimate_expressions(&self, face: &RgbImage) -> Result<Expressions, InferenceError> {
        let kind = ModelKind::Expression;
        let input = to_input_tensor(face, self.attribute_input_size);
        let outputs = Self::run_inference(&self.expression, kind, input)?;

        let logits: Vec<f32> = outputs
            .first()
            .map(|output| output.iter().copied().collect())
            .unwrap_or_default();

        Expressions::from_slice(&softmax(&logits)).ok_or_else(|| InferenceError::Output {
            kind,
            reason: format!("expected 7 expression values, got {}", logits.len()),
        })
    }
}

impl FaceAnalyzer for OrtFaceAnalyzer {
    #[instrument(skip_all, fields(width = frame.width(), height = frame.height()))]
    fn analyze(&self, frame: &RgbImage) -> Result<Vec<Detection>, InferenceError> {
        let kind = ModelKind::FaceDetector;
        let input = to_input_tensor(frame, self.detector_input_size);
        let outputs = Self::run_inference(&self.detector, kind, input)?;
        let output = outputs.first().ok_or_else(|| InferenceError::Output {
            kind,
            reason: "model produced no outputs".into(),
        })?;

        let candidates = decode_detector_output(
            output.view(),
            self.detector_input_size,
            frame.width(),
            frame.height(),
            self.min_confidence,
        )
        .map_err(|reason| InferenceError::Output { kind, reason })?;

        let faces = non_max_suppression(candidates, self.iou_threshold);
        let frame_size = DisplaySize::new(frame.width(), frame.height());

        let mut detections = Vec::with_capacity(faces.len());
        for face in faces {
            let Some(crop) = crop_face(frame, &face.bbox) else {
                continue;
            };
            let (age, gender, gender_probability) = self.estimate_age_gender(&crop)?;
            let expressions = self.estimate_expressions(&crop)?;

            detections.push(Detection {
                bbox: face.bbox.clamp_to(frame_size),
                score: face.score,
                expressions,
                age,
                gender,
                gender_probability,
            });
        }

        tracing::debug!("Analyzed frame: {} faces", detections.len());
        for (i, detection) in detections.iter().enumerate() {
            tracing::debug!(
                "Face {}: score={:.3}, bbox=({:.1}, {:.1}, {:.1}, {:.1}), {}",
                i,
                detection.score,
                detection.bbox.x,
                detection.bbox.y,
                detection.bbox.width,
                detection.bbox.height,
                detection.age_gender_label()
            );
        }

        Ok(detections)
    }
}

fn load_session(config: &ModelConfig, kind: ModelKind) -> Result<Session, ModelLoadError> {
    let path = model_resolver::resolve(
        kind,
        &config.base,
        config.file_name(kind),
        config.cache_dir.as_deref(),
    )?;
    let session = build_session(kind, &path)?;
    tracing::info!("Loaded {} model from {:?}", kind, path);
    Ok(session)
}

fn build_session(kind: ModelKind, path: &Path) -> Result<Session, ModelLoadError> {
    let session_error = |e: &dyn std::fmt::Display| ModelLoadError::Session {
        kind,
        reason: e.to_string(),
    };

    Session::builder()
        .map_err(|e| session_error(&e))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| session_error(&e))?
        .commit_from_file(path)
        .map_err(|e| session_error(&e))
}

/// Loads the ONNX Runtime backed analyzer from a [`ModelConfig`].
#[derive(Debug, Clone)]
pub struct OrtModelLoader {
    config: ModelConfig,
}

impl OrtModelLoader {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }
}

impl ModelLoader for OrtModelLoader {
    type Analyzer = OrtFaceAnalyzer;

    fn load(&self) -> Result<OrtFaceAnalyzer, ModelLoadError> {
        OrtFaceAnalyzer::load(&self.config)
    }
}
