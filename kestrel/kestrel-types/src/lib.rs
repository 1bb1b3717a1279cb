//! Shared vocabulary for the kestrel pipeline.
//!
//! Everything that crosses a crate boundary lives here: camera and frame
//! identifiers, pixel geometry, the fixed-layout detection table written into
//! shared memory, tracked-object snapshots and the event payloads derived
//! from them.

use serde::{Deserialize, Serialize};

mod geometry;
mod polygon;
mod snapshot;
mod stats;

pub use geometry::{PixelRect, SquareRegion};
pub use polygon::Polygon;
pub use stats::FpsCounter;
pub use snapshot::{EventKind, EventMessage, SnapshotSample, TrackedObjectSnapshot};

/// Maximum number of rows in one detection result table.
pub const MAX_DETECTIONS: usize = 20;

/// Floats per detection row: `[class, score, y1, x1, y2, x2]`.
pub const DETECTION_ROW_FLOATS: usize = 6;

/// Bytes of one detection result table (float32 rows).
pub const DETECTION_TABLE_BYTES: usize = MAX_DETECTIONS * DETECTION_ROW_FLOATS * 4;

/// The original camera name from the configuration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CamName(String);

impl CamName {
    pub fn new<S: Into<String>>(s: S) -> Self {
        CamName(s.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CamName {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, fmt)
    }
}

/// Monotonic per-camera frame sequence number.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct FrameNumber(pub u64);

impl FrameNumber {
    #[inline]
    pub fn next(self) -> FrameNumber {
        FrameNumber(self.0 + 1)
    }
}

impl std::fmt::Display for FrameNumber {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, fmt)
    }
}

/// Wall-clock time as fractional seconds since the unix epoch.
///
/// Frame stamps, event windows and retention arithmetic all use this
/// representation so that subtraction and comparison stay trivial.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct UnixTime(pub f64);

impl UnixTime {
    pub fn now() -> Self {
        UnixTime(chrono::Utc::now().timestamp_micros() as f64 / 1e6)
    }

    pub fn from_micros(micros: i64) -> Self {
        UnixTime(micros as f64 / 1e6)
    }

    pub fn as_micros(&self) -> i64 {
        (self.0 * 1e6).round() as i64
    }

    /// Seconds elapsed from `earlier` to `self` (negative if earlier is later).
    pub fn since(&self, earlier: UnixTime) -> f64 {
        self.0 - earlier.0
    }

    pub fn offset(&self, secs: f64) -> UnixTime {
        UnixTime(self.0 + secs)
    }
}

/// One normalized detection row as written by an accelerator worker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionRow {
    pub class_id: u32,
    pub score: f32,
    /// Corners in normalized `[0, 1]` region coordinates.
    pub y1: f32,
    pub x1: f32,
    pub y2: f32,
    pub x2: f32,
}

impl DetectionRow {
    pub fn is_empty(&self) -> bool {
        self.score == 0.0
    }
}

/// A detection mapped back to frame pixel coordinates with a resolved label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectDetection {
    pub label: String,
    pub score: f32,
    pub rect: PixelRect,
    /// The square region that inference ran over, in frame coordinates.
    pub region: SquareRegion,
}

/// Generate a tracked-object id: epoch seconds with microseconds, then a
/// 6-character random suffix, e.g. `1738006792.123456-a3k9vz`.
pub fn new_object_id(at: UnixTime) -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    let suffix: String = (0..6)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect();
    format!("{:.6}-{}", at.0, suffix)
}
