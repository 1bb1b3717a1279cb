use std::collections::BTreeMap;

use kestrel_types::ObjectDetection;

use crate::object::TrackedObject;

/// Greedy assignment of detections to tracked objects.
///
/// Cost is `1 - IoU` between the detection and the object's
/// velocity-predicted box, restricted to equal labels and IoU at least
/// `min_iou`. Ties break on label ordering first, then toward the larger
/// detection box.
pub(crate) fn greedy_assign(
    objects: &BTreeMap<String, TrackedObject>,
    detections: &[&ObjectDetection],
    min_iou: f64,
) -> Vec<(String, usize)> {
    struct Candidate<'a> {
        cost: f64,
        label: &'a str,
        det_area: i64,
        object_id: &'a str,
        det_idx: usize,
    }

    let mut candidates: Vec<Candidate> = Vec::new();
    for (object_id, object) in objects {
        let predicted = object.predicted_rect();
        for (det_idx, detection) in detections.iter().enumerate() {
            if detection.label != object.label {
                continue;
            }
            let iou = predicted.iou(&detection.rect);
            if iou < min_iou {
                continue;
            }
            candidates.push(Candidate {
                cost: 1.0 - iou,
                label: &object.label,
                det_area: detection.rect.area(),
                object_id,
                det_idx,
            });
        }
    }

    candidates.sort_by(|a, b| {
        a.cost
            .total_cmp(&b.cost)
            .then_with(|| a.label.cmp(b.label))
            .then_with(|| b.det_area.cmp(&a.det_area))
    });

    let mut used_objects: Vec<&str> = Vec::new();
    let mut used_detections: Vec<usize> = Vec::new();
    let mut matches = Vec::new();
    for candidate in candidates {
        if used_objects.contains(&candidate.object_id)
            || used_detections.contains(&candidate.det_idx)
        {
            continue;
        }
        used_objects.push(candidate.object_id);
        used_detections.push(candidate.det_idx);
        matches.push((candidate.object_id.to_string(), candidate.det_idx));
    }
    matches
}
