use crate::detection::FaceBox;
use ndarray::{ArrayViewD, Axis, Ix3};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub bbox: FaceBox,
    pub score: f32,
}

/// Decodes a detector output of shape `[1, C, N]` or `[1, N, C]` whose rows
/// are `(xc, yc, w, h, score...)` in input pixel coordinates. Boxes are
/// mapped back to a `frame_width x frame_height` frame.
pub fn decode_detector_output(
    output: ArrayViewD<'_, f32>,
    input_size: u32,
    frame_width: u32,
    frame_height: u32,
    min_confidence: f32,
) -> Result<Vec<Candidate>, String> {
    let output = output
        .into_dimensionality::<Ix3>()
        .map_err(|_| "expected a rank-3 detector output".to_string())?;
    let batch = output.index_axis(Axis(0), 0);

    // Anchors outnumber per-anchor values; put anchors on the row axis.
    let rows = if batch.shape()[0] < batch.shape()[1] {
        batch.reversed_axes()
    } else {
        batch
    };
    if rows.shape()[1] < 5 {
        return Err(format!(
            "detector rows carry {} values, need at least 5",
            rows.shape()[1]
        ));
    }

    let sx = frame_width as f32 / input_size as f32;
    let sy = frame_height as f32 / input_size as f32;

    let mut candidates = Vec::new();
    for row in rows.axis_iter(Axis(0)) {
        let score = row
            .iter()
            .skip(4)
            .copied()
            .fold(f32::MIN, f32::max);
        if score < min_confidence {
            continue;
        }

        let xc = row[0] * sx;
        let yc = row[1] * sy;
        let w = row[2] * sx;
        let h = row[3] * sy;
        let finite = [xc, yc, w, h].iter().all(|v| v.is_finite());
        if !finite || w <= 0.0 || h <= 0.0 {
            continue;
        }

        candidates.push(Candidate {
            bbox: FaceBox::new(xc - w / 2., yc - h / 2., w, h),
            score,
        });
    }

    Ok(candidates)
}

/// Greedy non-maximum suppression, most confident first.
pub fn non_max_suppression(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept = Vec::new();

    while !candidates.is_empty() {
        let best = candidates.remove(0);
        candidates.retain(|other| best.bbox.iou(&other.bbox) < iou_threshold);
        kept.push(best);
    }

    kept
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::MIN, f32::max);
    let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum <= 0.0 {
        return vec![0.0; logits.len()];
    }
    exps.into_iter().map(|v| v / sum).collect()
}
