use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Timelike, Utc};
use tracing::{debug, warn};

use kestrel_types::{CamName, UnixTime};

use crate::table::EventTable;
use crate::{Error, Result, RetainMode};

#[derive(Debug, Clone)]
pub struct SegmenterSettings {
    /// Cache root; segments land in `<cache>/<camera>/<epoch>-<rand>.mp4`.
    pub cache_dir: PathBuf,
    /// Finalized tree: `<record>/<camera>/<YYYY-MM-DD>/<HH>/<MM.SS>.mp4`.
    pub record_dir: PathBuf,
    /// Encoder segment duration in seconds.
    pub segment_duration: f64,
    pub retain_mode: RetainMode,
}

impl Default for SegmenterSettings {
    fn default() -> Self {
        SegmenterSettings {
            cache_dir: PathBuf::from("/tmp/cache"),
            record_dir: PathBuf::from("/media/kestrel/recordings"),
            segment_duration: 10.0,
            retain_mode: RetainMode::Motion,
        }
    }
}

/// How a segment's window relates to what the pipeline saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SegmentClass {
    Idle,
    Motion,
    ActiveObjects,
}

/// One encoder-produced file still in the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSegment {
    pub path: PathBuf,
    pub camera: CamName,
    pub start: UnixTime,
}

impl CacheSegment {
    /// Parse `<epoch>-<rand>.mp4`; the epoch may carry fractional seconds.
    pub fn parse(camera: &CamName, path: &Path) -> Result<CacheSegment> {
        let bad = || Error::BadSegmentName(path.to_path_buf());
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(bad)?;
        let (epoch, _rand) = stem.split_once('-').ok_or_else(bad)?;
        let start: f64 = epoch.parse().map_err(|_| bad())?;
        Ok(CacheSegment {
            path: path.to_path_buf(),
            camera: camera.clone(),
            start: UnixTime(start),
        })
    }
}

/// A segment moved into the dated recording tree.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSegment {
    pub path: PathBuf,
    pub camera: CamName,
    pub start: UnixTime,
    pub class: SegmentClass,
}

pub struct RecordingSegmenter {
    settings: SegmenterSettings,
}

impl RecordingSegmenter {
    pub fn new(settings: SegmenterSettings) -> RecordingSegmenter {
        RecordingSegmenter { settings }
    }

    pub fn settings(&self) -> &SegmenterSettings {
        &self.settings
    }

    /// List cache segments for one camera, oldest first. Unparseable names
    /// are skipped with a warning.
    pub fn scan_cache(&self, camera: &CamName) -> Result<Vec<CacheSegment>> {
        let dir = self.settings.cache_dir.join(camera.as_str());
        let mut segments = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(segments),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("mp4") {
                continue;
            }
            match CacheSegment::parse(camera, &path) {
                Ok(segment) => segments.push(segment),
                Err(err) => warn!("skipping cache file: {err}"),
            }
        }
        segments.sort_by(|a, b| a.start.0.total_cmp(&b.start.0));
        Ok(segments)
    }

    /// Classify a segment window against the event table and motion
    /// windows.
    pub fn classify(
        &self,
        segment: &CacheSegment,
        events: &EventTable,
        motion_windows: &[(UnixTime, UnixTime)],
    ) -> SegmentClass {
        let end = segment.start.offset(self.settings.segment_duration);
        let has_objects = events
            .rows()
            .any(|row| row.camera == segment.camera && row.overlaps(segment.start, end));
        if has_objects {
            return SegmentClass::ActiveObjects;
        }
        let has_motion = motion_windows
            .iter()
            .any(|(m_start, m_end)| m_start.0 < end.0 && m_end.0 > segment.start.0);
        if has_motion {
            SegmentClass::Motion
        } else {
            SegmentClass::Idle
        }
    }

    /// Destination path of a segment in the dated tree (UTC).
    pub fn stored_path(&self, segment: &CacheSegment) -> PathBuf {
        let when: DateTime<Utc> = DateTime::from_timestamp_micros(segment.start.as_micros())
            .unwrap_or_else(|| DateTime::from_timestamp(0, 0).expect("epoch is representable"));
        self.settings
            .record_dir
            .join(segment.camera.as_str())
            .join(format!(
                "{:04}-{:02}-{:02}",
                when.year(),
                when.month(),
                when.day()
            ))
            .join(format!("{:02}", when.hour()))
            .join(format!("{:02}.{:02}.mp4", when.minute(), when.second()))
    }

    /// Process finalized cache segments for one camera: classify each, move
    /// the keepers into the record tree, delete the rest. A segment is
    /// finalized once its window fully precedes `now`.
    pub fn ingest_finalized(
        &self,
        camera: &CamName,
        events: &EventTable,
        motion_windows: &[(UnixTime, UnixTime)],
        now: UnixTime,
    ) -> Result<Vec<StoredSegment>> {
        let mut stored = Vec::new();
        for segment in self.scan_cache(camera)? {
            if now.since(segment.start) < self.settings.segment_duration {
                continue; // still being written
            }
            let class = self.classify(&segment, events, motion_windows);
            let keep = match self.settings.retain_mode {
                RetainMode::All => true,
                RetainMode::Motion => class >= SegmentClass::Motion,
                RetainMode::ActiveObjects => class == SegmentClass::ActiveObjects,
            };
            if !keep {
                debug!(camera = %camera, "dropping idle segment {:?}", segment.path);
                if let Err(err) = std::fs::remove_file(&segment.path) {
                    warn!("cannot remove cache segment {:?}: {err}", segment.path);
                }
                continue;
            }
            let dest = self.stored_path(&segment);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(&segment.path, &dest)?;
            stored.push(StoredSegment {
                path: dest,
                camera: camera.clone(),
                start: segment.start,
                class,
            });
        }
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_types::{EventKind, EventMessage, PixelRect, SquareRegion, TrackedObjectSnapshot};

    fn settings(dir: &Path) -> SegmenterSettings {
        SegmenterSettings {
            cache_dir: dir.join("cache"),
            record_dir: dir.join("recordings"),
            segment_duration: 10.0,
            retain_mode: RetainMode::Motion,
        }
    }

    fn write_cache_segment(dir: &Path, camera: &str, epoch: f64) -> PathBuf {
        let cam_dir = dir.join("cache").join(camera);
        std::fs::create_dir_all(&cam_dir).unwrap();
        let path = cam_dir.join(format!("{epoch}-abc123.mp4"));
        std::fs::write(&path, b"fake mp4").unwrap();
        path
    }

    fn event(id: &str, camera: &str, start: f64, end: Option<f64>) -> EventMessage {
        EventMessage {
            kind: if end.is_some() {
                EventKind::End
            } else {
                EventKind::Start
            },
            camera: CamName::new(camera),
            data: TrackedObjectSnapshot {
                id: id.to_string(),
                camera: CamName::new(camera),
                label: "person".to_string(),
                sub_label: None,
                score: 0.8,
                top_score: 0.9,
                rect: PixelRect::new(0, 0, 10, 10),
                region: SquareRegion {
                    x: 0,
                    y: 0,
                    side: 320,
                },
                current_zones: Vec::new(),
                entered_zones: Vec::new(),
                stationary_since: None,
                false_positive: false,
                has_clip: true,
                has_snapshot: false,
                start_time: UnixTime(start),
                end_time: end.map(UnixTime),
                snapshot: None,
            },
        }
    }

    #[test]
    fn test_parse_segment_name() {
        let camera = CamName::new("front");
        let seg =
            CacheSegment::parse(&camera, Path::new("/cache/front/1700000000-a1b2c3.mp4")).unwrap();
        assert_eq!(seg.start, UnixTime(1700000000.0));

        assert!(CacheSegment::parse(&camera, Path::new("/cache/front/garbage.mp4")).is_err());
    }

    #[test]
    fn test_stored_path_layout() {
        let dir = tempfile::tempdir().unwrap();
        let segmenter = RecordingSegmenter::new(settings(dir.path()));
        let camera = CamName::new("front");
        // 2023-11-14 22:13:20 UTC
        let seg = CacheSegment {
            path: PathBuf::from("x"),
            camera,
            start: UnixTime(1700000000.0),
        };
        let path = segmenter.stored_path(&seg);
        let rel = path.strip_prefix(dir.path().join("recordings")).unwrap();
        assert_eq!(rel, Path::new("front/2023-11-14/22/13.20.mp4"));
    }

    #[test]
    fn test_classification() {
        let dir = tempfile::tempdir().unwrap();
        let segmenter = RecordingSegmenter::new(settings(dir.path()));
        let camera = CamName::new("front");
        let seg = CacheSegment {
            path: PathBuf::from("x"),
            camera: camera.clone(),
            start: UnixTime(1000.0),
        };

        let mut events = EventTable::new();
        assert_eq!(segmenter.classify(&seg, &events, &[]), SegmentClass::Idle);

        let motion = [(UnixTime(1005.0), UnixTime(1007.0))];
        assert_eq!(
            segmenter.classify(&seg, &events, &motion),
            SegmentClass::Motion
        );

        events.apply(&event("a", "front", 1008.0, None));
        assert_eq!(
            segmenter.classify(&seg, &events, &motion),
            SegmentClass::ActiveObjects
        );

        // an event on another camera does not count
        let mut other_cam = EventTable::new();
        other_cam.apply(&event("b", "back", 1008.0, None));
        assert_eq!(
            segmenter.classify(&seg, &other_cam, &[]),
            SegmentClass::Idle
        );
    }

    #[test]
    fn test_ingest_moves_keepers_and_drops_idle() {
        let dir = tempfile::tempdir().unwrap();
        let segmenter = RecordingSegmenter::new(settings(dir.path()));
        let camera = CamName::new("front");

        let idle_path = write_cache_segment(dir.path(), "front", 1000.0);
        let event_path = write_cache_segment(dir.path(), "front", 1100.0);
        let fresh_path = write_cache_segment(dir.path(), "front", 1195.0);

        let mut events = EventTable::new();
        events.apply(&event("a", "front", 1102.0, Some(1108.0)));

        let stored = segmenter
            .ingest_finalized(&camera, &events, &[], UnixTime(1200.0))
            .unwrap();

        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].class, SegmentClass::ActiveObjects);
        assert!(stored[0].path.exists());
        assert!(!idle_path.exists(), "idle segment must be deleted");
        assert!(!event_path.exists(), "kept segment must be moved");
        assert!(fresh_path.exists(), "unfinalized segment must stay");
    }
}
