use kestrel_types::{DetectionRow, MAX_DETECTIONS};

use crate::backend::ModelOutput;
use crate::{NMS_IOU, SCORE_MIN};

/// Maps several model class ids onto one output class id.
///
/// Some models split a user-facing label across classes (e.g. several
/// vehicle classes all surfaced as `car`); aggregation takes the best member
/// score for the group.
#[derive(Debug, Clone, Default)]
pub struct ClassAggregation {
    groups: Vec<(u32, Vec<u32>)>,
}

impl ClassAggregation {
    pub fn new(groups: Vec<(u32, Vec<u32>)>) -> ClassAggregation {
        ClassAggregation { groups }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Remap a single class id (SSD-style outputs).
    pub fn remap(&self, class_id: u32) -> u32 {
        for (out, members) in &self.groups {
            if members.contains(&class_id) {
                return *out;
            }
        }
        class_id
    }

    /// Best (class, score) over a per-class score vector (YOLO-style
    /// outputs): each group scores as the max of its members, ungrouped
    /// classes score as themselves.
    pub fn best(&self, class_scores: &[f32]) -> Option<(u32, f32)> {
        if self.groups.is_empty() {
            return class_scores
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, s)| (i as u32, *s));
        }
        let mut grouped_members: Vec<u32> = Vec::new();
        let mut best: Option<(u32, f32)> = None;
        let mut consider = |class: u32, score: f32| {
            if best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((class, score));
            }
        };
        for (out, members) in &self.groups {
            let score = members
                .iter()
                .filter_map(|m| class_scores.get(*m as usize))
                .fold(0.0f32, |acc, s| acc.max(*s));
            consider(*out, score);
            grouped_members.extend_from_slice(members);
        }
        for (i, score) in class_scores.iter().enumerate() {
            if !grouped_members.contains(&(i as u32)) {
                consider(i as u32, *score);
            }
        }
        best
    }
}

#[derive(Debug, Clone)]
pub struct PostProcess {
    /// Model input side `S` used to normalize YOLO pixel-unit boxes.
    pub input_side: u32,
    pub aggregation: ClassAggregation,
}

impl PostProcess {
    /// Reduce a raw model output to at most [`MAX_DETECTIONS`] rows.
    pub fn rows(&self, output: ModelOutput) -> Vec<DetectionRow> {
        match output {
            ModelOutput::Ssd {
                boxes,
                classes,
                scores,
                count,
            } => {
                let mut out = Vec::new();
                // model rows are score-ordered; stop at the first weak one
                for i in 0..count.min(boxes.len()).min(MAX_DETECTIONS) {
                    if scores[i] < SCORE_MIN {
                        break;
                    }
                    let [y1, x1, y2, x2] = boxes[i];
                    out.push(DetectionRow {
                        class_id: self.aggregation.remap(classes[i] as u32),
                        score: scores[i],
                        y1: y1.clamp(0.0, 1.0),
                        x1: x1.clamp(0.0, 1.0),
                        y2: y2.clamp(0.0, 1.0),
                        x2: x2.clamp(0.0, 1.0),
                    });
                }
                out
            }
            ModelOutput::Yolo { rows } => {
                let side = self.input_side as f32;
                let mut candidates: Vec<DetectionRow> = rows
                    .iter()
                    .filter_map(|row| {
                        let (class_id, score) = self.aggregation.best(&row.class_scores)?;
                        if score < SCORE_MIN {
                            return None;
                        }
                        Some(DetectionRow {
                            class_id,
                            score,
                            y1: ((row.cy - row.h / 2.0) / side).clamp(0.0, 1.0),
                            x1: ((row.cx - row.w / 2.0) / side).clamp(0.0, 1.0),
                            y2: ((row.cy + row.h / 2.0) / side).clamp(0.0, 1.0),
                            x2: ((row.cx + row.w / 2.0) / side).clamp(0.0, 1.0),
                        })
                    })
                    .collect();
                candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
                nms(candidates, NMS_IOU)
                    .into_iter()
                    .take(MAX_DETECTIONS)
                    .collect()
            }
        }
    }
}

fn norm_iou(a: &DetectionRow, b: &DetectionRow) -> f32 {
    let w = a.x2.min(b.x2) - a.x1.max(b.x1);
    let h = a.y2.min(b.y2) - a.y1.max(b.y1);
    if w <= 0.0 || h <= 0.0 {
        return 0.0;
    }
    let inter = w * h;
    let area_a = (a.x2 - a.x1) * (a.y2 - a.y1);
    let area_b = (b.x2 - b.x1) * (b.y2 - b.y1);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Greedy non-maximum suppression; `rows` must already be sorted by
/// descending score.
fn nms(rows: Vec<DetectionRow>, iou_thresh: f32) -> Vec<DetectionRow> {
    let mut kept: Vec<DetectionRow> = Vec::new();
    for row in rows {
        if kept.iter().all(|k| norm_iou(k, &row) <= iou_thresh) {
            kept.push(row);
        }
    }
    kept
}
