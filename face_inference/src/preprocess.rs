use crate::detection::{DisplaySize, FaceBox};
use image::{imageops::FilterType, RgbImage};
use ndarray::{Array, Ix4};

/// Resizes `image` to `size x size` and lays it out as a `[1, 3, size, size]`
/// tensor with channels scaled to `[0, 1]`.
pub fn to_input_tensor(image: &RgbImage, size: u32) -> Array<f32, Ix4> {
    let resized = image::imageops::resize(image, size, size, FilterType::Triangle);

    let side = size as usize;
    let mut input = Array::zeros((1, 3, side, side));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        let [r, g, b] = pixel.0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    input
}

/// Cuts the face region out of the frame. `None` when the box does not
/// cover at least one whole pixel inside the frame.
pub fn crop_face(image: &RgbImage, bbox: &FaceBox) -> Option<RgbImage> {
    let frame = DisplaySize::new(image.width(), image.height());
    let clamped = bbox.clamp_to(frame);

    let x = clamped.x.floor() as u32;
    let y = clamped.y.floor() as u32;
    let width = (clamped.right().ceil() as u32).min(frame.width).saturating_sub(x);
    let height = (clamped.bottom().ceil() as u32).min(frame.height).saturating_sub(y);
    if width == 0 || height == 0 {
        return None;
    }

    Some(image::imageops::crop_imm(image, x, y, width, height).to_image())
}
