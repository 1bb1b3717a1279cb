use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use kestrel_types::{CamName, EventKind, EventMessage, UnixTime};

/// Persisted projection of a tracked object, mirrored from bus messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRow {
    pub id: String,
    pub camera: CamName,
    pub label: String,
    pub start_time: UnixTime,
    pub end_time: Option<UnixTime>,
    pub top_score: f32,
    pub zones: Vec<String>,
    pub has_clip: bool,
    pub has_snapshot: bool,
    pub retain_indefinitely: bool,
}

impl EventRow {
    pub fn duration(&self) -> f64 {
        self.end_time
            .map(|end| end.since(self.start_time))
            .unwrap_or(0.0)
    }

    /// Whether the event window overlaps `[start, end)`.
    pub fn overlaps(&self, start: UnixTime, end: UnixTime) -> bool {
        let event_end = self.end_time.unwrap_or(UnixTime(f64::INFINITY));
        self.start_time.0 < end.0 && event_end.0 > start.0
    }
}

/// The in-process event store. All writes flow through the supervisor's
/// serialized queue, so this needs no interior locking.
#[derive(Debug, Default)]
pub struct EventTable {
    rows: BTreeMap<String, EventRow>,
}

impl EventTable {
    pub fn new() -> EventTable {
        EventTable::default()
    }

    /// Apply one bus message. Start inserts, update/end upsert; an ended
    /// row is never reopened.
    pub fn apply(&mut self, message: &EventMessage) {
        let data = &message.data;
        let row = EventRow {
            id: data.id.clone(),
            camera: data.camera.clone(),
            label: data.label.clone(),
            start_time: data.start_time,
            end_time: data.end_time,
            top_score: data.top_score,
            zones: data.entered_zones.clone(),
            has_clip: data.has_clip,
            has_snapshot: data.has_snapshot,
            retain_indefinitely: false,
        };
        match self.rows.get_mut(&data.id) {
            Some(existing) => {
                if existing.end_time.is_some() && message.kind != EventKind::End {
                    return;
                }
                let retain = existing.retain_indefinitely;
                *existing = row;
                existing.retain_indefinitely = retain;
            }
            None => {
                self.rows.insert(data.id.clone(), row);
            }
        }
    }

    pub fn set_retain_indefinitely(&mut self, id: &str, retain: bool) {
        if let Some(row) = self.rows.get_mut(id) {
            row.retain_indefinitely = retain;
        }
    }

    pub fn get(&self, id: &str) -> Option<&EventRow> {
        self.rows.get(id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> impl Iterator<Item = &EventRow> {
        self.rows.values()
    }

    pub fn remove(&mut self, id: &str) -> Option<EventRow> {
        self.rows.remove(id)
    }

    /// Drop rows that have neither a clip nor a snapshot (nothing to show).
    pub fn drop_medialess_ended(&mut self) -> usize {
        let before = self.rows.len();
        self.rows
            .retain(|_, row| row.end_time.is_none() || row.has_clip || row.has_snapshot);
        before - self.rows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_types::{PixelRect, SquareRegion, TrackedObjectSnapshot};

    fn message(kind: EventKind, id: &str, end: Option<f64>) -> EventMessage {
        EventMessage {
            kind,
            camera: CamName::new("front"),
            data: TrackedObjectSnapshot {
                id: id.to_string(),
                camera: CamName::new("front"),
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
                entered_zones: vec!["porch".to_string()],
                stationary_since: None,
                false_positive: false,
                has_clip: true,
                has_snapshot: false,
                start_time: UnixTime(1000.0),
                end_time: end.map(UnixTime),
                snapshot: None,
            },
        }
    }

    #[test]
    fn test_apply_start_then_end() {
        let mut table = EventTable::new();
        table.apply(&message(EventKind::Start, "a", None));
        assert_eq!(table.len(), 1);
        assert!(table.get("a").unwrap().end_time.is_none());

        table.apply(&message(EventKind::End, "a", Some(1020.0)));
        let row = table.get("a").unwrap();
        assert_eq!(row.end_time, Some(UnixTime(1020.0)));
        assert_eq!(row.duration(), 20.0);
    }

    #[test]
    fn test_ended_row_not_reopened_by_update() {
        let mut table = EventTable::new();
        table.apply(&message(EventKind::Start, "a", None));
        table.apply(&message(EventKind::End, "a", Some(1020.0)));
        table.apply(&message(EventKind::Update, "a", None));
        assert_eq!(table.get("a").unwrap().end_time, Some(UnixTime(1020.0)));
    }

    #[test]
    fn test_retain_flag_survives_updates() {
        let mut table = EventTable::new();
        table.apply(&message(EventKind::Start, "a", None));
        table.set_retain_indefinitely("a", true);
        table.apply(&message(EventKind::Update, "a", None));
        assert!(table.get("a").unwrap().retain_indefinitely);
    }

    #[test]
    fn test_overlaps() {
        let mut table = EventTable::new();
        table.apply(&message(EventKind::Start, "a", Some(1020.0)));
        let row = table.get("a").unwrap();
        assert!(row.overlaps(UnixTime(1010.0), UnixTime(1015.0)));
        assert!(row.overlaps(UnixTime(995.0), UnixTime(1001.0)));
        assert!(!row.overlaps(UnixTime(1020.0), UnixTime(1030.0)));
        assert!(!row.overlaps(UnixTime(990.0), UnixTime(1000.0)));
    }

    #[test]
    fn test_drop_medialess_ended() {
        let mut table = EventTable::new();
        let mut no_media = message(EventKind::End, "a", Some(1020.0));
        no_media.data.has_clip = false;
        table.apply(&no_media);
        table.apply(&message(EventKind::End, "b", Some(1020.0))); // has clip
        table.apply(&message(EventKind::Start, "c", None)); // live, keep

        assert_eq!(table.drop_medialess_ended(), 1);
        assert!(table.get("a").is_none());
        assert!(table.get("b").is_some());
        assert!(table.get("c").is_some());
    }
}
