use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use kestrel_types::UnixTime;

use crate::segments::StoredSegment;
use crate::table::EventTable;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Duplicate events share a camera, a label and a 5-second start bucket.
const DUPLICATE_BUCKET_SECS: f64 = 5.0;

/// Age-based retention: a default in days plus per-label overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetainPolicy {
    pub default_days: f64,
    pub objects: BTreeMap<String, f64>,
}

impl RetainPolicy {
    pub fn days_for_label(&self, label: &str) -> f64 {
        self.objects.get(label).copied().unwrap_or(self.default_days)
    }
}

impl Default for RetainPolicy {
    fn default() -> Self {
        RetainPolicy {
            default_days: 10.0,
            objects: BTreeMap::new(),
        }
    }
}

/// Delete stored segments past their retention and drop them from the
/// registry. Segments overlapping a `retain_indefinitely` event are always
/// preserved; otherwise the most generous overlapping label policy wins.
/// Returns the number of segments deleted. Filesystem errors are logged and
/// skipped so one bad mount cannot stall the reaper.
pub fn prune_expired_segments(
    segments: &mut Vec<StoredSegment>,
    events: &EventTable,
    policy: &RetainPolicy,
    segment_duration: f64,
    now: UnixTime,
) -> usize {
    let mut deleted = 0usize;
    segments.retain(|segment| {
        let end = segment.start.offset(segment_duration);
        let overlapping: Vec<_> = events
            .rows()
            .filter(|row| row.camera == segment.camera && row.overlaps(segment.start, end))
            .collect();

        if overlapping.iter().any(|row| row.retain_indefinitely) {
            return true;
        }
        let retain_days = overlapping
            .iter()
            .map(|row| policy.days_for_label(&row.label))
            .fold(policy.default_days, f64::max);
        let age_days = now.since(segment.start) / SECONDS_PER_DAY;
        if age_days <= retain_days {
            return true;
        }

        debug!(camera = %segment.camera, "pruning expired segment {:?}", segment.path);
        match std::fs::remove_file(&segment.path) {
            Ok(()) => {
                deleted += 1;
                false
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                deleted += 1;
                false
            }
            Err(err) => {
                // permission problems are logged, not fatal
                warn!("cannot prune segment {:?}: {err}", segment.path);
                true
            }
        }
    });
    deleted
}

fn remove_media(clips_dir: &Path, camera: &str, id: &str) {
    let base = format!("{camera}-{id}");
    for name in [
        format!("{base}.mp4"),
        format!("{base}.jpg"),
        format!("{base}-clean.png"),
    ] {
        let path = clips_dir.join(name);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("cannot remove media {path:?}: {err}"),
        }
    }
}

/// Remove duplicate ended events: same camera and label starting within one
/// 5-second bucket. The longest event of each bucket survives; the others
/// are dropped from the table along with their media files. Returns the
/// removed ids.
pub fn purge_duplicate_events(table: &mut EventTable, clips_dir: &Path) -> Vec<String> {
    // (camera, label, bucket) -> ids
    let mut buckets: BTreeMap<(String, String, i64), Vec<String>> = BTreeMap::new();
    for row in table.rows() {
        if row.end_time.is_none() {
            continue;
        }
        let bucket = (row.start_time.0 / DUPLICATE_BUCKET_SECS).round() as i64;
        buckets
            .entry((row.camera.as_str().to_string(), row.label.clone(), bucket))
            .or_default()
            .push(row.id.clone());
    }

    let mut removed = Vec::new();
    for ((camera, _label, _bucket), ids) in buckets {
        if ids.len() < 2 {
            continue;
        }
        let keep = ids
            .iter()
            .max_by(|a, b| {
                let da = table.get(a).map(|r| r.duration()).unwrap_or(0.0);
                let db = table.get(b).map(|r| r.duration()).unwrap_or(0.0);
                da.total_cmp(&db)
            })
            .cloned()
            .expect("bucket is nonempty");
        for id in ids {
            if id == keep {
                continue;
            }
            debug!(camera = %camera, "removing duplicate event {id}");
            table.remove(&id);
            remove_media(clips_dir, &camera, &id);
            removed.push(id);
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segments::SegmentClass;
    use kestrel_types::{
        CamName, EventKind, EventMessage, PixelRect, SquareRegion, TrackedObjectSnapshot,
    };
    use std::path::PathBuf;

    fn ended_event(id: &str, camera: &str, label: &str, start: f64, end: f64) -> EventMessage {
        EventMessage {
            kind: EventKind::End,
            camera: CamName::new(camera),
            data: TrackedObjectSnapshot {
                id: id.to_string(),
                camera: CamName::new(camera),
                label: label.to_string(),
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
                has_snapshot: true,
                start_time: UnixTime(start),
                end_time: Some(UnixTime(end)),
                snapshot: None,
            },
        }
    }

    fn stored_segment(dir: &Path, camera: &str, start: f64) -> StoredSegment {
        let path = dir.join(format!("{camera}-{start}.mp4"));
        std::fs::write(&path, b"seg").unwrap();
        StoredSegment {
            path,
            camera: CamName::new(camera),
            start: UnixTime(start),
            class: SegmentClass::Motion,
        }
    }

    #[test]
    fn test_prune_respects_age_and_label_policy() {
        let dir = tempfile::tempdir().unwrap();
        let day = SECONDS_PER_DAY;
        let now = UnixTime(100.0 * day);

        let mut events = EventTable::new();
        // a "car" event covering the second segment; cars retain 30 days
        events.apply(&ended_event(
            "car1",
            "front",
            "car",
            95.0 * day,
            95.0 * day + 60.0,
        ));

        let mut segments = vec![
            stored_segment(dir.path(), "front", 80.0 * day), // 20 days old, idle
            stored_segment(dir.path(), "front", 95.0 * day), // 5 days old, car
            stored_segment(dir.path(), "front", 99.0 * day), // 1 day old
        ];
        let policy = RetainPolicy {
            default_days: 10.0,
            objects: BTreeMap::from([("car".to_string(), 30.0)]),
        };

        let deleted = prune_expired_segments(&mut segments, &events, &policy, 10.0, now);
        assert_eq!(deleted, 1);
        assert_eq!(segments.len(), 2);
        assert!(segments.iter().all(|s| s.start.0 >= 95.0 * day));
    }

    #[test]
    fn test_prune_keeps_retained_events_forever() {
        let dir = tempfile::tempdir().unwrap();
        let day = SECONDS_PER_DAY;
        let now = UnixTime(1000.0 * day);

        let mut events = EventTable::new();
        events.apply(&ended_event(
            "keep",
            "front",
            "person",
            10.0 * day,
            10.0 * day + 60.0,
        ));
        events.set_retain_indefinitely("keep", true);

        let mut segments = vec![stored_segment(dir.path(), "front", 10.0 * day)];
        let deleted = prune_expired_segments(
            &mut segments,
            &events,
            &RetainPolicy::default(),
            10.0,
            now,
        );
        assert_eq!(deleted, 0);
        assert_eq!(segments.len(), 1);
        assert!(segments[0].path.exists());
    }

    #[test]
    fn test_purge_duplicates_keeps_longest_and_removes_media() {
        let dir = tempfile::tempdir().unwrap();
        let clips = dir.path().to_path_buf();

        let mut table = EventTable::new();
        let mut media: Vec<PathBuf> = Vec::new();
        for i in 0..10 {
            let id = format!("evt{i}");
            // all start inside one 5-second bucket, durations 10..100
            let start = 1000.0 + (i as f64) * 0.2;
            let end = start + 10.0 + (i as f64) * 10.0;
            table.apply(&ended_event(&id, "front", "person", start, end));
            let clip = clips.join(format!("front-{id}.mp4"));
            let snap = clips.join(format!("front-{id}.jpg"));
            std::fs::write(&clip, b"clip").unwrap();
            std::fs::write(&snap, b"snap").unwrap();
            media.push(clip);
            media.push(snap);
        }

        let removed = purge_duplicate_events(&mut table, &clips);
        assert_eq!(removed.len(), 9);
        assert_eq!(table.len(), 1);
        // the longest-running duplicate survives
        assert!(table.get("evt9").is_some());
        // media of removed events is gone, the survivor's remains
        for path in &media {
            let survivor = path.file_name().unwrap().to_str().unwrap().contains("evt9");
            assert_eq!(path.exists(), survivor, "{path:?}");
        }
    }

    #[test]
    fn test_purge_ignores_different_buckets_and_labels() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = EventTable::new();
        table.apply(&ended_event("a", "front", "person", 1000.0, 1010.0));
        table.apply(&ended_event("b", "front", "person", 1100.0, 1110.0));
        table.apply(&ended_event("c", "front", "car", 1000.0, 1010.0));
        table.apply(&ended_event("d", "back", "person", 1000.0, 1010.0));

        let removed = purge_duplicate_events(&mut table, dir.path());
        assert!(removed.is_empty());
        assert_eq!(table.len(), 4);
    }
}
