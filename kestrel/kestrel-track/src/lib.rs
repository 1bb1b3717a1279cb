//! Cross-frame object tracking.
//!
//! The tracker consumes labeled detections in strict capture order and
//! maintains the set of live tracked objects for one camera: assignment by
//! IoU against velocity-predicted boxes, a candidate gestation period before
//! an object is confirmed, zone membership with inertia, stationarity, and
//! best-snapshot selection. Each call returns the lifecycle deltas the event
//! engine needs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use kestrel_types::{
    new_object_id, CamName, FrameNumber, ObjectDetection, PixelRect, Polygon,
    TrackedObjectSnapshot, UnixTime,
};

mod assignment;
mod object;
mod zones;

use object::TrackedObject;
pub use zones::{ZoneAnchor, ZoneDef};

/// Consecutive confirming frames before a candidate becomes a tracked
/// object.
pub const CONFIRM_FRAMES: u32 = 3;

/// Minimum IoU for a detection to match a tracked object.
pub const MATCH_MIN_IOU: f64 = 0.2;

/// Per-label acceptance bounds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabelFilter {
    pub min_area: Option<i64>,
    pub max_area: Option<i64>,
    pub min_score: f32,
    /// Score at which a candidate is confirmed without waiting out the
    /// gestation period.
    pub fast_confirm: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub camera: CamName,
    pub width: u32,
    pub height: u32,
    /// Consecutive misses before a confirmed object is terminated.
    pub max_disappeared: u32,
    pub stationary_threshold_px: u32,
    pub stationary_threshold_secs: f64,
    pub tracked_labels: Vec<String>,
    pub filters: BTreeMap<String, LabelFilter>,
    pub zones: Vec<ZoneDef>,
    pub zone_anchor: ZoneAnchor,
    /// Detections whose anchor falls inside any of these polygons are
    /// discarded (permanently static scenery that fools the model).
    pub object_mask: Vec<Polygon>,
    /// Reject snapshot candidates whose box touches the frame edge.
    pub snapshot_reject_clipped: bool,
    /// Seconds after termination during which a matching detection
    /// resurrects the old id. The end delta is held back until this window
    /// expires, so an ended event is never re-opened.
    pub resurrect_window_secs: f64,
}

impl TrackerSettings {
    pub fn minimal(camera: CamName, width: u32, height: u32) -> TrackerSettings {
        TrackerSettings {
            camera,
            width,
            height,
            max_disappeared: 25,
            stationary_threshold_px: 10,
            stationary_threshold_secs: 10.0,
            tracked_labels: vec!["person".to_string()],
            filters: BTreeMap::new(),
            zones: Vec::new(),
            zone_anchor: ZoneAnchor::BottomCenter,
            object_mask: Vec::new(),
            snapshot_reject_clipped: true,
            resurrect_window_secs: 5.0,
        }
    }
}

/// Lifecycle change of one tracked object, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerDelta {
    New(TrackedObjectSnapshot),
    Update(TrackedObjectSnapshot),
    Ended(TrackedObjectSnapshot),
}

/// Counters surfaced in the stats snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackerCounters {
    pub out_of_order_dropped: u64,
    pub filtered_detections: u64,
    pub resurrected: u64,
}

pub struct ObjectTracker {
    settings: TrackerSettings,
    objects: BTreeMap<String, TrackedObject>,
    /// Recently terminated objects eligible for id resurrection.
    ended: Vec<TrackedObject>,
    last_frame: Option<FrameNumber>,
    counters: TrackerCounters,
}

impl ObjectTracker {
    pub fn new(settings: TrackerSettings) -> ObjectTracker {
        ObjectTracker {
            settings,
            objects: BTreeMap::new(),
            ended: Vec::new(),
            last_frame: None,
            counters: TrackerCounters::default(),
        }
    }

    pub fn counters(&self) -> TrackerCounters {
        self.counters
    }

    /// Predicted boxes of confirmed objects, for the region planner.
    pub fn active_boxes(&self) -> Vec<PixelRect> {
        self.objects
            .values()
            .filter(|o| o.confirmed)
            .map(|o| o.predicted_rect())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.objects.values().filter(|o| o.confirmed).count()
    }

    /// Ingest one frame's detections (already mapped to frame coordinates
    /// and labels). Frames must arrive in capture order; anything else is
    /// dropped.
    pub fn observe(
        &mut self,
        frame: FrameNumber,
        at: UnixTime,
        detections: &[ObjectDetection],
    ) -> Vec<TrackerDelta> {
        if let Some(last) = self.last_frame {
            if frame <= last {
                self.counters.out_of_order_dropped += 1;
                debug!(
                    camera = %self.settings.camera,
                    "dropping out-of-order detections: frame {frame} after {last}"
                );
                return Vec::new();
            }
        }
        self.last_frame = Some(frame);

        let mut deltas = Vec::new();
        // terminated objects whose resurrection window lapsed now emit
        // their end
        for object in self.expire_resurrectable(at) {
            deltas.push(TrackerDelta::Ended(object.snapshot(&self.settings)));
        }

        let detections: Vec<&ObjectDetection> = detections
            .iter()
            .filter(|d| self.accepts(d))
            .collect();

        let matches = assignment::greedy_assign(
            &self.objects,
            &detections,
            MATCH_MIN_IOU,
        );

        let mut matched_objects = Vec::new();
        let mut matched_detections = vec![false; detections.len()];
        for (object_id, det_idx) in &matches {
            matched_objects.push(object_id.clone());
            matched_detections[*det_idx] = true;
            let object = self.objects.get_mut(object_id).expect("matched id exists");
            object.update(at, detections[*det_idx], &self.settings);
        }

        // unmatched detections: resurrect a recent track or start a
        // candidate
        for (idx, &detection) in detections.iter().enumerate() {
            if matched_detections[idx] {
                continue;
            }
            if let Some(pos) = self.find_resurrectable(detection) {
                let mut object = self.ended.swap_remove(pos);
                debug!(camera = %self.settings.camera, id = %object.id, "resurrecting track");
                self.counters.resurrected += 1;
                object.missed = 0;
                object.end_time = None;
                object.removed_at = None;
                object.update(at, detection, &self.settings);
                matched_objects.push(object.id.clone());
                self.objects.insert(object.id.clone(), object);
            } else {
                let object = TrackedObject::new(
                    new_object_id(at),
                    self.settings.camera.clone(),
                    at,
                    detection,
                );
                matched_objects.push(object.id.clone());
                self.objects.insert(object.id.clone(), object);
            }
        }

        // unmatched objects miss a frame; candidates must confirm in
        // consecutive frames, so a single miss ends them
        let mut terminated = Vec::new();
        for (id, object) in self.objects.iter_mut() {
            if matched_objects.contains(id) {
                continue;
            }
            object.missed += 1;
            if !object.confirmed || object.missed > self.settings.max_disappeared {
                terminated.push(id.clone());
            }
        }
        for id in terminated {
            let mut object = self.objects.remove(&id).expect("terminating id exists");
            if object.confirmed {
                // the end delta is deferred until the resurrection window
                // lapses; a reappearing object continues its event instead
                object.end_time = Some(object.last_seen);
                object.removed_at = Some(at);
                self.ended.push(object);
            }
        }

        // confirmations and updates
        for id in &matched_objects {
            let object = self.objects.get_mut(id).expect("matched id exists");
            if !object.confirmed {
                let fast = self
                    .settings
                    .filters
                    .get(&object.label)
                    .and_then(|f| f.fast_confirm)
                    .map(|threshold| object.score >= threshold)
                    .unwrap_or(false);
                if object.consecutive >= CONFIRM_FRAMES || fast {
                    object.confirmed = true;
                    object.false_positive = false;
                    deltas.push(TrackerDelta::New(object.snapshot(&self.settings)));
                    continue;
                }
            } else {
                deltas.push(TrackerDelta::Update(object.snapshot(&self.settings)));
            }
        }

        deltas
    }

    fn accepts(&mut self, detection: &ObjectDetection) -> bool {
        if !self
            .settings
            .tracked_labels
            .iter()
            .any(|l| l == &detection.label)
        {
            self.counters.filtered_detections += 1;
            return false;
        }
        if let Some(filter) = self.settings.filters.get(&detection.label) {
            let area = detection.rect.area();
            let too_small = filter.min_area.map(|m| area < m).unwrap_or(false);
            let too_big = filter.max_area.map(|m| area > m).unwrap_or(false);
            if too_small || too_big || detection.score < filter.min_score {
                self.counters.filtered_detections += 1;
                return false;
            }
        }
        let (ax, ay) = self.settings.zone_anchor.point(&detection.rect);
        if self
            .settings
            .object_mask
            .iter()
            .any(|mask| mask.contains(ax as f64, ay as f64))
        {
            self.counters.filtered_detections += 1;
            return false;
        }
        true
    }

    fn find_resurrectable(&self, detection: &ObjectDetection) -> Option<usize> {
        self.ended
            .iter()
            .position(|o| o.label == detection.label && o.rect.iou(&detection.rect) >= MATCH_MIN_IOU)
    }

    fn expire_resurrectable(&mut self, at: UnixTime) -> Vec<TrackedObject> {
        let window = self.settings.resurrect_window_secs;
        let (expired, kept) = std::mem::take(&mut self.ended)
            .into_iter()
            .partition(|o| {
                o.removed_at
                    .map(|removed| at.since(removed) > window)
                    .unwrap_or(true)
            });
        self.ended = kept;
        expired
    }

    /// Close out every live and pending-end object (shutdown path). Returns
    /// snapshots with `end_time` set for everything that had started.
    pub fn drain(&mut self, at: UnixTime) -> Vec<TrackedObjectSnapshot> {
        let settings = &self.settings;
        let mut snapshots: Vec<TrackedObjectSnapshot> = self
            .objects
            .values()
            .filter(|o| o.confirmed)
            .map(|o| {
                let mut snap = o.snapshot(settings);
                snap.end_time = Some(at);
                snap
            })
            .collect();
        snapshots.extend(self.ended.iter().map(|o| o.snapshot(settings)));
        self.objects.clear();
        self.ended.clear();
        snapshots
    }
}
