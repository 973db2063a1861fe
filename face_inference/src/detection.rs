use serde::Deserialize;
use std::fmt;

/// Axis-aligned face region in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl FaceBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self::new(x1, y1, x2 - x1, y2 - y1)
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn intersection(&self, other: &FaceBox) -> f32 {
        let w = self.right().min(other.right()) - self.x.max(other.x);
        let h = self.bottom().min(other.bottom()) - self.y.max(other.y);
        if w <= 0.0 || h <= 0.0 {
            return 0.0;
        }
        w * h
    }

    pub fn iou(&self, other: &FaceBox) -> f32 {
        let inter = self.intersection(other);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            return 0.0;
        }
        inter / union
    }

    pub fn scale(&self, sx: f32, sy: f32) -> FaceBox {
        FaceBox::new(self.x * sx, self.y * sy, self.width * sx, self.height * sy)
    }

    /// Clips the box to `[0, width) x [0, height)`.
    pub fn clamp_to(&self, size: DisplaySize) -> FaceBox {
        let x1 = self.x.clamp(0.0, size.width as f32);
        let y1 = self.y.clamp(0.0, size.height as f32);
        let x2 = self.right().clamp(0.0, size.width as f32);
        let y2 = self.bottom().clamp(0.0, size.height as f32);
        FaceBox::from_corners(x1, y1, x2, y2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DisplaySize {
    pub width: u32,
    pub height: u32,
}

impl DisplaySize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for DisplaySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expression {
    Neutral,
    Happy,
    Sad,
    Angry,
    Fearful,
    Disgusted,
    Surprised,
}

impl Expression {
    /// Output order of the expression model.
    pub const ALL: [Expression; 7] = [
        Expression::Neutral,
        Expression::Happy,
        Expression::Sad,
        Expression::Angry,
        Expression::Fearful,
        Expression::Disgusted,
        Expression::Surprised,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Expression::Neutral => "neutral",
            Expression::Happy => "happy",
            Expression::Sad => "sad",
            Expression::Angry => "angry",
            Expression::Fearful => "fearful",
            Expression::Disgusted => "disgusted",
            Expression::Surprised => "surprised",
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-expression confidences. Values are not required to sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Expressions([f32; 7]);

impl Expressions {
    pub fn new(probabilities: [f32; 7]) -> Self {
        Self(probabilities)
    }

    /// Builds the mapping from a model output vector; `None` when the vector
    /// does not carry exactly one value per expression.
    pub fn from_slice(values: &[f32]) -> Option<Self> {
        let probabilities: [f32; 7] = values.try_into().ok()?;
        Some(Self(probabilities))
    }

    pub fn get(&self, expression: Expression) -> f32 {
        self.0[expression as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Expression, f32)> + '_ {
        Expression::ALL.iter().copied().zip(self.0.iter().copied())
    }

    /// Expressions at or above `min_confidence`, most confident first.
    pub fn ranked_above(&self, min_confidence: f32) -> Vec<(Expression, f32)> {
        let mut ranked: Vec<_> = self.iter().filter(|(_, p)| *p >= min_confidence).collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked
    }
}

/// One face found in a frame together with its derived attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: FaceBox,
    pub score: f32,
    pub expressions: Expressions,
    pub age: f32,
    pub gender: Gender,
    pub gender_probability: f32,
}

impl Detection {
    /// `"23 yrs, male (87%)"`: age and percentage are rounded half away from zero.
    pub fn age_gender_label(&self) -> String {
        format!(
            "{} yrs, {} ({}%)",
            self.age.round() as i64,
            self.gender,
            (f64::from(self.gender_probability) * 100.0).round() as i64
        )
    }

    pub fn rescaled(&self, native: DisplaySize, display: DisplaySize) -> Detection {
        let sx = display.width as f32 / native.width as f32;
        let sy = display.height as f32 / native.height as f32;
        Detection {
            bbox: self.bbox.scale(sx, sy),
            ..self.clone()
        }
    }
}

/// Rescales detections from the native analysis resolution to the display
/// resolution. An empty native size leaves the detections untouched.
pub fn resize_results(
    detections: Vec<Detection>,
    native: DisplaySize,
    display: DisplaySize,
) -> Vec<Detection> {
    if native.is_empty() || native == display {
        return detections;
    }
    detections
        .iter()
        .map(|detection| detection.rescaled(native, display))
        .collect()
}

#[cfg(test)]
pub(crate) fn sample_detection(bbox: FaceBox) -> Detection {
    Detection {
        bbox,
        score: 0.93,
        expressions: Expressions::new([0.02, 0.9, 0.01, 0.01, 0.0, 0.0, 0.06]),
        age: 23.4,
        gender: Gender::Male,
        gender_probability: 0.87,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_age_gender_label() {
        let detection = sample_detection(FaceBox::new(0.0, 0.0, 10.0, 10.0));
        assert_eq!(detection.age_gender_label(), "23 yrs, male (87%)");
    }

    #[test]
    fn test_age_gender_label_rounds_half_up() {
        let mut detection = sample_detection(FaceBox::new(0.0, 0.0, 10.0, 10.0));
        detection.age = 30.5;
        detection.gender = Gender::Female;
        detection.gender_probability = 0.995;
        assert_eq!(detection.age_gender_label(), "31 yrs, female (100%)");
    }

    #[test]
    fn test_age_gender_label_percent_uses_stored_probability() {
        let mut detection = sample_detection(FaceBox::new(0.0, 0.0, 10.0, 10.0));
        // 0.285f32 is slightly below 0.285.
        detection.gender_probability = 0.285;
        assert_eq!(detection.age_gender_label(), "23 yrs, male (28%)");
    }

    #[test]
    fn test_resize_results_scales_both_axes() {
        let native = DisplaySize::new(640, 480);
        let display = DisplaySize::new(500, 400);
        let detections = vec![
            sample_detection(FaceBox::new(64.0, 48.0, 128.0, 96.0)),
            sample_detection(FaceBox::new(320.0, 240.0, 32.0, 24.0)),
        ];

        let resized = resize_results(detections.clone(), native, display);

        let sx = 500.0 / 640.0;
        let sy = 400.0 / 480.0;
        for (original, scaled) in detections.iter().zip(resized.iter()) {
            assert!((scaled.bbox.x - original.bbox.x * sx).abs() < 1e-4);
            assert!((scaled.bbox.y - original.bbox.y * sy).abs() < 1e-4);
            assert!((scaled.bbox.width - original.bbox.width * sx).abs() < 1e-4);
            assert!((scaled.bbox.height - original.bbox.height * sy).abs() < 1e-4);
            assert_eq!(scaled.age, original.age);
            assert_eq!(scaled.expressions, original.expressions);
        }
    }

    #[test]
    fn test_resize_results_same_size_is_identity() {
        let size = DisplaySize::new(640, 480);
        let detections = vec![sample_detection(FaceBox::new(1.0, 2.0, 3.0, 4.0))];
        assert_eq!(resize_results(detections.clone(), size, size), detections);
    }

    #[test]
    fn test_iou() {
        let a = FaceBox::new(0.0, 0.0, 10.0, 10.0);
        let b = FaceBox::new(5.0, 0.0, 10.0, 10.0);
        let c = FaceBox::new(20.0, 20.0, 5.0, 5.0);

        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(a.iou(&c), 0.0);
    }

    #[test]
    fn test_clamp_to_frame() {
        let clamped = FaceBox::new(-10.0, 5.0, 50.0, 500.0).clamp_to(DisplaySize::new(100, 100));
        assert_eq!(clamped, FaceBox::new(0.0, 5.0, 40.0, 95.0));
    }

    #[test]
    fn test_expressions_ranked_above() {
        let expressions = Expressions::new([0.05, 0.6, 0.0, 0.0, 0.0, 0.0, 0.35]);
        let ranked = expressions.ranked_above(0.1);
        assert_eq!(
            ranked,
            vec![(Expression::Happy, 0.6), (Expression::Surprised, 0.35)]
        );
    }

    #[test]
    fn test_expressions_from_slice_requires_seven_values() {
        assert!(Expressions::from_slice(&[0.1; 6]).is_none());
        let expressions = Expressions::from_slice(&[0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]).unwrap();
        assert_eq!(expressions.get(Expression::Angry), 1.0);
    }
}
