use std::collections::{BTreeMap, VecDeque};

use kestrel_types::{
    CamName, ObjectDetection, PixelRect, SnapshotSample, SquareRegion, TrackedObjectSnapshot,
    UnixTime,
};

use crate::TrackerSettings;

/// Bounded history of (timestamp, box, score, region) samples.
const MAX_HISTORY: usize = 25;

/// Score samples used for the smoothed top score.
const SCORE_WINDOW: usize = 10;

#[derive(Debug, Clone)]
pub(crate) struct Sample {
    pub at: UnixTime,
    pub rect: PixelRect,
    pub score: f32,
    pub region: SquareRegion,
}

#[derive(Debug, Clone)]
pub(crate) struct TrackedObject {
    pub id: String,
    pub camera: CamName,
    pub label: String,
    pub start_time: UnixTime,
    pub last_seen: UnixTime,
    pub end_time: Option<UnixTime>,
    pub rect: PixelRect,
    pub region: SquareRegion,
    pub score: f32,
    pub top_score: f32,
    pub history: VecDeque<Sample>,
    /// Pixels per second, from the last two samples.
    pub velocity: (f64, f64),
    pub confirmed: bool,
    pub false_positive: bool,
    /// Consecutive matched frames while still a candidate.
    pub consecutive: u32,
    pub missed: u32,
    pub current_zones: Vec<String>,
    /// First-entry order is preserved and asserted by tests.
    pub entered_zones: Vec<String>,
    pub zone_presence: BTreeMap<String, u32>,
    pub zone_entered_at: BTreeMap<String, UnixTime>,
    stationary_anchor: Option<(i64, i64, UnixTime)>,
    pub stationary_since: Option<UnixTime>,
    pub best: Option<SnapshotSample>,
    /// When the tracker removed this object (start of the resurrection
    /// window).
    pub removed_at: Option<UnixTime>,
}

impl TrackedObject {
    pub fn new(
        id: String,
        camera: CamName,
        at: UnixTime,
        detection: &ObjectDetection,
    ) -> TrackedObject {
        let mut history = VecDeque::with_capacity(MAX_HISTORY);
        history.push_back(Sample {
            at,
            rect: detection.rect,
            score: detection.score,
            region: detection.region,
        });
        TrackedObject {
            id,
            camera,
            label: detection.label.clone(),
            start_time: at,
            last_seen: at,
            end_time: None,
            rect: detection.rect,
            region: detection.region,
            score: detection.score,
            top_score: 0.0,
            history,
            velocity: (0.0, 0.0),
            confirmed: false,
            false_positive: true,
            consecutive: 1,
            missed: 0,
            current_zones: Vec::new(),
            entered_zones: Vec::new(),
            zone_presence: BTreeMap::new(),
            zone_entered_at: BTreeMap::new(),
            stationary_anchor: None,
            stationary_since: None,
            best: None,
            removed_at: None,
        }
    }

    /// Last box extrapolated by the current velocity and time since the last
    /// observation.
    pub fn predicted_rect(&self) -> PixelRect {
        let frames_missed = self.missed.max(1) as f64;
        // velocity is per-observation here; one missed frame, one step
        let dx = (self.velocity.0 * frames_missed) as i64;
        let dy = (self.velocity.1 * frames_missed) as i64;
        self.rect.translate(dx, dy)
    }

    pub fn update(&mut self, at: UnixTime, detection: &ObjectDetection, settings: &TrackerSettings) {
        let previous_centroid = self.rect.centroid();

        self.rect = detection.rect;
        self.region = detection.region;
        self.score = detection.score;
        self.last_seen = at;
        self.missed = 0;
        self.consecutive += 1;

        let centroid = self.rect.centroid();
        self.velocity = (
            (centroid.0 - previous_centroid.0) as f64,
            (centroid.1 - previous_centroid.1) as f64,
        );

        if self.history.len() == MAX_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(Sample {
            at,
            rect: detection.rect,
            score: detection.score,
            region: detection.region,
        });

        // smoothed top score: the median of the recent window, kept at its
        // maximum so one lucky frame cannot dominate
        let smoothed = self.smoothed_score();
        if smoothed > self.top_score {
            self.top_score = smoothed;
        }

        self.update_zones(at, settings);
        self.update_stationary(at, settings);
        self.consider_snapshot(at, settings);
    }

    fn smoothed_score(&self) -> f32 {
        let mut recent: Vec<f32> = self
            .history
            .iter()
            .rev()
            .take(SCORE_WINDOW)
            .map(|s| s.score)
            .collect();
        recent.sort_by(|a, b| a.total_cmp(b));
        recent[recent.len() / 2]
    }

    fn update_zones(&mut self, at: UnixTime, settings: &TrackerSettings) {
        let (ax, ay) = settings.zone_anchor.point(&self.rect);
        for zone in &settings.zones {
            if !zone.applies_to(&self.label) {
                continue;
            }
            let inside = zone.polygon.contains(ax as f64, ay as f64);
            if inside {
                let presence = self.zone_presence.entry(zone.name.clone()).or_insert(0);
                *presence += 1;
                if *presence >= zone.inertia {
                    if !self.current_zones.contains(&zone.name) {
                        self.current_zones.push(zone.name.clone());
                    }
                    if !self.entered_zones.contains(&zone.name) {
                        self.entered_zones.push(zone.name.clone());
                    }
                    self.zone_entered_at.entry(zone.name.clone()).or_insert(at);
                }
            } else {
                self.zone_presence.insert(zone.name.clone(), 0);
                self.current_zones.retain(|z| z != &zone.name);
            }
        }
    }

    fn update_stationary(&mut self, at: UnixTime, settings: &TrackerSettings) {
        let (cx, cy) = self.rect.centroid();
        match self.stationary_anchor {
            Some((ax, ay, since)) => {
                let wander = (((cx - ax).pow(2) + (cy - ay).pow(2)) as f64).sqrt();
                if wander > settings.stationary_threshold_px as f64 {
                    self.stationary_anchor = Some((cx, cy, at));
                    self.stationary_since = None;
                } else if at.since(since) >= settings.stationary_threshold_secs
                    && self.stationary_since.is_none()
                {
                    self.stationary_since = Some(since);
                }
            }
            None => {
                self.stationary_anchor = Some((cx, cy, at));
            }
        }
    }

    fn consider_snapshot(&mut self, at: UnixTime, settings: &TrackerSettings) {
        if settings.snapshot_reject_clipped
            && self.rect.touches_edge(settings.width, settings.height)
        {
            return;
        }
        let better = self.best.as_ref().map(|b| self.score > b.score).unwrap_or(true);
        if better {
            self.best = Some(SnapshotSample {
                rect: self.rect,
                score: self.score,
                region: self.region,
                at,
                thumbnail: None,
            });
        }
    }

    pub fn snapshot(&self, _settings: &TrackerSettings) -> TrackedObjectSnapshot {
        TrackedObjectSnapshot {
            id: self.id.clone(),
            camera: self.camera.clone(),
            label: self.label.clone(),
            sub_label: None,
            score: self.score,
            top_score: self.top_score,
            rect: self.rect,
            region: self.region,
            current_zones: self.current_zones.clone(),
            entered_zones: self.entered_zones.clone(),
            stationary_since: self.stationary_since,
            false_positive: self.false_positive,
            has_clip: false,
            has_snapshot: false,
            start_time: self.start_time,
            end_time: self.end_time,
            snapshot: self.best.clone(),
        }
    }
}
