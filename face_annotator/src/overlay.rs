use crate::config::OverlayConfig;
use face_inference::{Detection, DisplaySize, FaceBox};
use image::RgbImage;
use opencv::{
    core::{self, Mat, Point, Rect, Scalar, Size, Vector},
    imgcodecs, imgproc,
    prelude::*,
};
use thiserror::Error;

const LINE_HEIGHT: i32 = 18;

#[derive(Error, Debug)]
pub enum OverlayError {
    #[error("Failed to encode frame: {0}")]
    EncodeFrameFailed(opencv::Error),
    #[error("OpenCV error: {0}")]
    OpenCvError(opencv::Error),
    #[error("Frame of {width}x{height} has an unexpected pixel layout")]
    FrameLayout { width: i32, height: i32 },
}

impl From<opencv::Error> for OverlayError {
    fn from(err: opencv::Error) -> Self {
        OverlayError::OpenCvError(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl Color {
    pub const BOX: Color = Color::rgb(0, 255, 0);
    pub const LABEL: Color = Color::rgb(255, 255, 255);
    pub const EXPRESSION: Color = Color::rgb(255, 200, 0);

    pub const fn rgb(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }

    fn to_bgra(self) -> Scalar {
        Scalar::new(self.blue as f64, self.green as f64, self.red as f64, 255.0)
    }
}

/// A 2D drawing target the overlay renderer paints on.
pub trait Surface {
    /// Erases everything previously drawn.
    fn clear(&mut self) -> Result<(), OverlayError>;

    fn stroke_rect(&mut self, rect: &FaceBox, color: Color, width: i32)
        -> Result<(), OverlayError>;

    /// Draws `text` with its baseline starting at `(x, y)`.
    fn fill_text(&mut self, text: &str, x: i32, y: i32, color: Color)
        -> Result<(), OverlayError>;
}

#[derive(Debug, Clone)]
pub struct OverlayStyle {
    pub min_expression_confidence: f32,
    pub line_width: i32,
    pub font_scale: f64,
}

impl From<&OverlayConfig> for OverlayStyle {
    fn from(config: &OverlayConfig) -> Self {
        Self {
            min_expression_confidence: config.min_expression_confidence,
            line_width: config.line_width,
            font_scale: config.font_scale,
        }
    }
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self::from(&OverlayConfig::default())
    }
}

/// Clears `surface` and draws every detection: its box, the expressions
/// above the confidence floor below the box, and the age/gender label above it.
pub fn render_detections<S: Surface + ?Sized>(
    surface: &mut S,
    detections: &[Detection],
    style: &OverlayStyle,
) -> Result<(), OverlayError> {
    surface.clear()?;

    for detection in detections {
        let bbox = &detection.bbox;
        surface.stroke_rect(bbox, Color::BOX, style.line_width)?;

        let left = bbox.x.round() as i32;
        let mut line_y = bbox.bottom().round() as i32 + LINE_HEIGHT;
        for (expression, confidence) in detection
            .expressions
            .ranked_above(style.min_expression_confidence)
        {
            let text = format!("{} ({:.2})", expression, confidence);
            surface.fill_text(&text, left, line_y, Color::EXPRESSION)?;
            line_y += LINE_HEIGHT;
        }

        surface.fill_text(
            &detection.age_gender_label(),
            left,
            bbox.y.round() as i32 - 5,
            Color::LABEL,
        )?;
    }

    Ok(())
}

/// Transparent BGRA canvas composited over the video frame.
pub struct OverlayCanvas {
    mat: Mat,
    size: DisplaySize,
    font_scale: f64,
}

impl OverlayCanvas {
    pub fn new(size: DisplaySize, font_scale: f64) -> Result<Self, OverlayError> {
        Ok(Self {
            mat: Self::transparent(size)?,
            size,
            font_scale,
        })
    }

    fn transparent(size: DisplaySize) -> Result<Mat, OverlayError> {
        Ok(Mat::new_rows_cols_with_default(
            size.height as i32,
            size.width as i32,
            core::CV_8UC4,
            Scalar::all(0.0),
        )?)
    }

    /// Resizes `frame` to the canvas size and paints the opaque canvas
    /// pixels over it.
    pub fn composite(&self, frame: &Mat) -> Result<Mat, OverlayError> {
        let mut output = Mat::default();
        imgproc::resize(
            frame,
            &mut output,
            Size::new(self.size.width as i32, self.size.height as i32),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )?;

        let mut alpha = Mat::default();
        core::extract_channel(&self.mat, &mut alpha, 3)?;
        let mut bgr = Mat::default();
        imgproc::cvt_color_def(&self.mat, &mut bgr, imgproc::COLOR_BGRA2BGR)?;
        bgr.copy_to_masked(&mut output, &alpha)?;

        Ok(output)
    }
}

impl Surface for OverlayCanvas {
    fn clear(&mut self) -> Result<(), OverlayError> {
        self.mat = Self::transparent(self.size)?;
        Ok(())
    }

    fn stroke_rect(
        &mut self,
        rect: &FaceBox,
        color: Color,
        width: i32,
    ) -> Result<(), OverlayError> {
        imgproc::rectangle(
            &mut self.mat,
            Rect::new(
                rect.x.round() as i32,
                rect.y.round() as i32,
                rect.width.round() as i32,
                rect.height.round() as i32,
            ),
            color.to_bgra(),
            width,
            imgproc::LINE_8,
            0,
        )?;
        Ok(())
    }

    fn fill_text(&mut self, text: &str, x: i32, y: i32, color: Color) -> Result<(), OverlayError> {
        imgproc::put_text(
            &mut self.mat,
            text,
            Point::new(x, y),
            imgproc::FONT_HERSHEY_SIMPLEX,
            self.font_scale,
            color.to_bgra(),
            1,
            imgproc::LINE_AA,
            false,
        )?;
        Ok(())
    }
}

/// Converts an OpenCV BGR frame into the RGB image the analyzer consumes.
pub fn mat_to_rgb(frame: &Mat) -> Result<RgbImage, OverlayError> {
    let mut rgb = Mat::default();
    imgproc::cvt_color_def(frame, &mut rgb, imgproc::COLOR_BGR2RGB)?;

    let (width, height) = (rgb.cols(), rgb.rows());
    let data = rgb.data_bytes()?.to_vec();
    RgbImage::from_raw(width as u32, height as u32, data)
        .ok_or(OverlayError::FrameLayout { width, height })
}

pub fn encode_jpg(frame: &Mat) -> Result<Vec<u8>, OverlayError> {
    let mut buf = Vector::<u8>::new();
    imgcodecs::imencode(".jpg", frame, &mut buf, &Vector::new())
        .map_err(OverlayError::EncodeFrameFailed)?;
    Ok(buf.into())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub enum DrawOp {
        Clear,
        Rect(FaceBox),
        Text(String, i32, i32),
    }

    /// Records draw calls instead of rasterizing them.
    #[derive(Debug, Default)]
    pub struct RecordingSurface {
        pub ops: Vec<DrawOp>,
    }

    impl RecordingSurface {
        /// Operations since the most recent clear, `None` if never cleared.
        pub fn last_frame(&self) -> Option<&[DrawOp]> {
            let start = self.ops.iter().rposition(|op| *op == DrawOp::Clear)?;
            Some(&self.ops[start + 1..])
        }

        pub fn clears(&self) -> usize {
            self.ops.iter().filter(|op| **op == DrawOp::Clear).count()
        }
    }

    impl Surface for RecordingSurface {
        fn clear(&mut self) -> Result<(), OverlayError> {
            self.ops.push(DrawOp::Clear);
            Ok(())
        }

        fn stroke_rect(&mut self, rect: &FaceBox, _: Color, _: i32) -> Result<(), OverlayError> {
            self.ops.push(DrawOp::Rect(*rect));
            Ok(())
        }

        fn fill_text(&mut self, text: &str, x: i32, y: i32, _: Color) -> Result<(), OverlayError> {
            self.ops.push(DrawOp::Text(text.to_string(), x, y));
            Ok(())
        }
    }
}
