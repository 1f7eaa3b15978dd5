//! Class-wise greedy non-maximum suppression.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::result::Detection;

/// Suppress overlapping detections of the same class.
///
/// For each class: sort by confidence descending, keep the best box, discard every
/// remaining box of that class whose IoU with it exceeds `iou_threshold`, repeat.
/// Boxes of different classes never suppress each other. The result is ordered by
/// confidence descending and truncated to `max_detections`.
pub fn non_max_suppression(
    detections: Vec<Detection>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<Detection> {
    let mut by_class: BTreeMap<usize, Vec<Detection>> = BTreeMap::new();
    for det in detections {
        by_class.entry(det.class_id).or_default().push(det);
    }

    let mut kept = Vec::new();
    for (_, mut group) in by_class {
        group.sort_by(by_confidence_desc);
        let mut survivors: Vec<Detection> = Vec::with_capacity(group.len());
        'candidates: for candidate in group {
            for keeper in &survivors {
                if keeper.bbox.iou(&candidate.bbox) > iou_threshold {
                    continue 'candidates;
                }
            }
            survivors.push(candidate);
        }
        kept.extend(survivors);
    }

    kept.sort_by(by_confidence_desc);
    kept.truncate(max_detections);
    kept
}

fn by_confidence_desc(a: &Detection, b: &Detection) -> Ordering {
    b.confidence
        .partial_cmp(&a.confidence)
        .unwrap_or(Ordering::Equal)
}
