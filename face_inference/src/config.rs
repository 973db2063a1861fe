use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;

/// The three artifacts that make up the face analysis stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    FaceDetector,
    AgeGender,
    Expression,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::FaceDetector => "face_detector",
            ModelKind::AgeGender => "age_gender",
            ModelKind::Expression => "expression",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    /// Local directory or `http(s)://` base URL holding the artifacts.
    pub base: String,
    #[serde(default = "default_detector_file")]
    pub detector_file: String,
    #[serde(default = "default_age_gender_file")]
    pub age_gender_file: String,
    #[serde(default = "default_expression_file")]
    pub expression_file: String,
    #[serde(default = "default_detector_input_size")]
    pub detector_input_size: u32,
    #[serde(default = "default_attribute_input_size")]
    pub attribute_input_size: u32,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
    /// Overrides the per-user cache used for artifacts fetched from a URL.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

fn default_detector_file() -> String {
    "tiny_face_detector.onnx".into()
}

fn default_age_gender_file() -> String {
    "age_gender.onnx".into()
}

fn default_expression_file() -> String {
    "face_expression.onnx".into()
}

fn default_detector_input_size() -> u32 {
    416
}

fn default_attribute_input_size() -> u32 {
    112
}

fn default_min_confidence() -> f32 {
    0.5
}

fn default_iou_threshold() -> f32 {
    0.3
}

impl ModelConfig {
    pub fn file_name(&self, kind: ModelKind) -> &str {
        match kind {
            ModelKind::FaceDetector => &self.detector_file,
            ModelKind::AgeGender => &self.age_gender_file,
            ModelKind::Expression => &self.expression_file,
        }
    }

    pub fn is_remote(&self) -> bool {
        crate::model_resolver::is_url(&self.base)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.base.trim().is_empty() {
            return Err("models.base must not be empty".into());
        }
        if self.detector_input_size == 0 || self.attribute_input_size == 0 {
            return Err("model input sizes must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(format!(
                "models.min_confidence must be within [0, 1], got {}",
                self.min_confidence
            ));
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(format!(
                "models.iou_threshold must be within [0, 1], got {}",
                self.iou_threshold
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_config(base: &str) -> ModelConfig {
    ModelConfig {
        base: base.to_string(),
        detector_file: default_detector_file(),
        age_gender_file: default_age_gender_file(),
        expression_file: default_expression_file(),
        detector_input_size: default_detector_input_size(),
        attribute_input_size: default_attribute_input_size(),
        min_confidence: default_min_confidence(),
        iou_threshold: default_iou_threshold(),
        cache_dir: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_per_kind() {
        let config = test_config("./models");
        assert_eq!(
            config.file_name(ModelKind::FaceDetector),
            "tiny_face_detector.onnx"
        );
        assert_eq!(config.file_name(ModelKind::AgeGender), "age_gender.onnx");
        assert_eq!(
            config.file_name(ModelKind::Expression),
            "face_expression.onnx"
        );
    }

    #[test]
    fn test_remote_base_detection() {
        assert!(test_config("https://cdn.example.com/models").is_remote());
        assert!(test_config("http://localhost:8000/models").is_remote());
        assert!(!test_config("/opt/models").is_remote());
    }

    #[test]
    fn test_validate_rejects_out_of_range_confidence() {
        let mut config = test_config("./models");
        assert!(config.validate().is_ok());

        config.min_confidence = 1.5;
        assert!(config.validate().is_err());
    }
}
