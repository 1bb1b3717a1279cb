//! Recording segment coordination.
//!
//! The encoder child writes fixed-duration segments into a per-camera cache
//! directory. This crate decides what happens to them: classification
//! against event and motion windows, the move into the dated recording
//! tree, age-based retention with per-label policies, and the reaper passes
//! that delete expired segments and duplicate events.

use std::path::PathBuf;

mod reaper;
mod segments;
mod table;

pub use reaper::{purge_duplicate_events, prune_expired_segments, RetainPolicy};
pub use segments::{
    CacheSegment, RecordingSegmenter, SegmentClass, SegmenterSettings, StoredSegment,
};
pub use table::{EventRow, EventTable};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("unparseable segment file name: {0}")]
    BadSegmentName(PathBuf),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Which segment classes are retained past the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetainMode {
    /// Keep everything, including idle segments.
    All,
    /// Keep segments with motion or active objects.
    #[default]
    Motion,
    /// Keep only segments overlapping active tracked objects.
    ActiveObjects,
}
