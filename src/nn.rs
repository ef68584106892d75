use std::path::Path;

use anyhow::{Context, Result};
use ndarray::s;
use smallvec::SmallVec;
use tract_onnx::prelude::*;

use crate::preproc::InputLayout;

pub type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;
pub type NnOut = SmallVec<[Arc<Tensor>; 4]>;

/// Bounding box `[x_tl, y_tl, x_br, y_br]` in normalized image coordinates.
pub type Bbox = [f32; 4];

/// Positive additive constant to avoid divide-by-zero.
const EPS: f32 = 1.0e-7;

/// Load an Ultraface-family ONNX model and compile it into a runnable plan.
///
/// The input fact is pinned to `(1, 3, h, w)` f32 as given by `layout`.
pub fn load_model(path: impl AsRef<Path>, layout: &InputLayout) -> Result<NnModel> {
    let path = path.as_ref();
    let input_fact = InferenceFact::dt_shape(
        f32::datum_type(),
        tvec!(1, 3, layout.height as usize, layout.width as usize),
    );
    let model = tract_onnx::onnx()
        .model_for_path(path)
        .with_context(|| format!("reading model from {}", path.display()))?
        .with_input_fact(0, input_fact)?
        .into_optimized()?
        .into_runnable()?;

    log::info!(
        "Loaded model {} with input {}x{}",
        path.display(),
        layout.width,
        layout.height
    );

    Ok(model)
}

/// Decode raw network output into selected bounding boxes with confidences.
///
/// Expects the Ultraface output layout: confidences as `[1, N, 2]` (index 1
/// holds the positive class) and boxes as `[1, N, 4]` corner coordinates.
/// Candidates below `min_confidence` are discarded before non-maximum
/// suppression with the `max_iou` overlap limit.
pub fn decode_detections(
    raw_nn_out: &NnOut,
    min_confidence: f32,
    max_iou: f32,
) -> Result<Vec<(Bbox, f32)>> {
    let confidences = raw_nn_out[0]
        .to_array_view::<f32>()?
        .slice(s![0, .., 1])
        .to_vec();

    let bboxes: Vec<Bbox> = raw_nn_out[1]
        .to_array_view::<f32>()?
        .as_slice()
        .context("box output is not contiguous")?
        .chunks_exact(4)
        .map(|chunk| [chunk[0], chunk[1], chunk[2], chunk[3]])
        .collect();

    let mut bboxes_with_confidences: Vec<_> = bboxes
        .iter()
        .zip(confidences.iter())
        .filter_map(|(bbox, confidence)| match confidence {
            x if *x > min_confidence => Some((bbox, confidence)),
            _ => None,
        })
        .collect();

    bboxes_with_confidences.sort_by(|a, b| a.1.total_cmp(b.1));

    Ok(non_maximum_suppression(bboxes_with_confidences, max_iou))
}

/// Run non-maximum-suppression on candidate bounding boxes.
///
/// Start with the most confident bounding box and iterate over all other
/// bounding boxes in the order of sinking confidence. Grow the vector of
/// selected bounding boxes by adding only those candidates which do not have
/// a maximum IoU `max_iou` with already chosen bounding boxes.
fn non_maximum_suppression(
    mut sorted_bboxes_with_confidences: Vec<(&Bbox, &f32)>,
    max_iou: f32,
) -> Vec<(Bbox, f32)> {
    let mut selected = vec![];
    'candidates: loop {
        // Get next most confident bbox from the back of ascending-sorted vector.
        // All boxes fulfill the minimum confidence criterium.
        match sorted_bboxes_with_confidences.pop() {
            Some((bbox, confidence)) => {
                // Check for overlap with any of the selected bboxes
                for (selected_bbox, _) in selected.iter() {
                    match iou(bbox, selected_bbox) {
                        x if x > max_iou => continue 'candidates,
                        _ => (),
                    }
                }

                // bbox has no large overlap with any of the selected ones, add it
                selected.push((*bbox, *confidence))
            }
            None => break 'candidates,
        }
    }

    selected
}

/// Calculate the intersection-over-union metric for two bounding boxes.
fn iou(bbox_a: &Bbox, bbox_b: &Bbox) -> f32 {
    // Calculate corner points of overlap box
    // If the boxes do not overlap, the corner-points will be ill defined, i.e. the top left
    // corner point will be below and to the right of the bottom right corner point. In this case,
    // the area will be zero.
    let overlap_box: Bbox = [
        f32::max(bbox_a[0], bbox_b[0]),
        f32::max(bbox_a[1], bbox_b[1]),
        f32::min(bbox_a[2], bbox_b[2]),
        f32::min(bbox_a[3], bbox_b[3]),
    ];

    let overlap_area = bbox_area(&overlap_box);

    // Avoid division-by-zero with `EPS`
    overlap_area / (bbox_area(bbox_a) + bbox_area(bbox_b) - overlap_area + EPS)
}

/// Calculate the area enclosed by a bounding box.
///
/// The bounding box is passed as four-element array defining two points:
/// `[x_top_left, y_top_left, x_bottom_right, y_bottom_right]`
/// If the bounding box is ill-defined by having the bottom-right point above/to the left of the
/// top-left point, the area is zero.
fn bbox_area(bbox: &Bbox) -> f32 {
    let width = bbox[2] - bbox[0];
    let height = bbox[3] - bbox[1];
    if width < 0.0 || height < 0.0 {
        // bbox is empty/undefined since the bottom-right corner is above the top left corner
        return 0.0;
    }

    width * height
}

#[cfg(test)]
mod test {
    use super::*;

    /// Build network output in the Ultraface layout from (bbox, confidence) pairs.
    fn fake_output(detections: &[(Bbox, f32)]) -> NnOut {
        let n = detections.len();
        let confidences = tract_ndarray::Array3::from_shape_fn((1, n, 2), |(_, i, class)| {
            let c = detections[i].1;
            match class {
                1 => c,
                _ => 1.0 - c,
            }
        });
        let bboxes =
            tract_ndarray::Array3::from_shape_fn((1, n, 4), |(_, i, k)| detections[i].0[k]);

        smallvec::smallvec![confidences.into_arc_tensor(), bboxes.into_arc_tensor()]
    }

    #[test]
    fn decode_filters_low_confidence_candidates() {
        let raw = fake_output(&[([0.1, 0.1, 0.2, 0.2], 0.9), ([0.5, 0.5, 0.6, 0.6], 0.3)]);

        let selected = decode_detections(&raw, 0.5, 0.5).unwrap();

        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].0, [0.1, 0.1, 0.2, 0.2]);
    }

    #[test]
    fn decode_suppresses_overlapping_boxes() {
        // Two boxes almost on top of each other plus one separate box.
        let raw = fake_output(&[
            ([0.1, 0.1, 0.3, 0.3], 0.8),
            ([0.11, 0.11, 0.31, 0.31], 0.95),
            ([0.6, 0.6, 0.8, 0.8], 0.7),
        ]);

        let selected = decode_detections(&raw, 0.5, 0.5).unwrap();

        assert_eq!(selected.len(), 2);
        // Most confident of the overlapping pair wins and comes first.
        assert_eq!(selected[0].0, [0.11, 0.11, 0.31, 0.31]);
        assert_eq!(selected[1].0, [0.6, 0.6, 0.8, 0.8]);
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let bbox = [0.2, 0.2, 0.4, 0.5];
        assert!((iou(&bbox, &bbox) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = [0.0, 0.0, 0.1, 0.1];
        let b = [0.5, 0.5, 0.9, 0.9];
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn area_of_inverted_box_is_zero() {
        assert_eq!(bbox_area(&[0.5, 0.5, 0.2, 0.9]), 0.0);
    }
}
