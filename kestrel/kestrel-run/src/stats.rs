use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use kestrel_types::UnixTime;

/// Lock-free per-camera counters written by the pipeline worker.
#[derive(Debug, Default)]
pub struct CameraMetrics {
    pub process_fps_millis: AtomicU64,
    pub detection_fps_millis: AtomicU64,
    pub detector_timeouts: AtomicU64,
    pub detector_unavailable: AtomicU64,
    /// Frames whose inference was skipped because the global queue was
    /// full.
    pub queue_full_skips: AtomicU64,
    pub active_objects: AtomicU64,
    pub out_of_order_dropped: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CameraStats {
    pub camera_fps: f64,
    pub process_fps: f64,
    pub detection_fps: f64,
    pub skipped_fps: f64,
    pub skipped_total: u64,
    pub decoder_pid: Option<u32>,
    pub decoder_restarts: u64,
    pub active_objects: u64,
    pub detector_timeouts: u64,
    pub detector_unavailable: u64,
    pub queue_full_skips: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectorStats {
    pub name: String,
    pub last_inference_age_secs: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub at: UnixTime,
    pub cameras: BTreeMap<String, CameraStats>,
    pub detectors: Vec<DetectorStats>,
    pub events_live: usize,
    pub events_total: usize,
}

/// Turns monotonically increasing totals into rates between assemblies.
#[derive(Debug, Default)]
pub struct RateTracker {
    previous: BTreeMap<String, (UnixTime, u64)>,
}

impl RateTracker {
    pub fn rate(&mut self, key: &str, now: UnixTime, total: u64) -> f64 {
        let rate = match self.previous.get(key) {
            Some((then, prev_total)) => {
                let dt = now.since(*then);
                if dt <= 0.0 {
                    0.0
                } else {
                    total.saturating_sub(*prev_total) as f64 / dt
                }
            }
            None => 0.0,
        };
        self.previous.insert(key.to_string(), (now, total));
        rate
    }
}

impl CameraMetrics {
    pub fn store_fps(target: &AtomicU64, fps: f64) {
        target.store((fps * 1000.0) as u64, Ordering::Relaxed);
    }

    pub fn load_fps(target: &AtomicU64) -> f64 {
        target.load(Ordering::Relaxed) as f64 / 1000.0
    }
}
