use serde::{Deserialize, Serialize};

use crate::{CamName, PixelRect, SquareRegion, UnixTime};

/// The best-scoring observation kept for a tracked object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSample {
    pub rect: PixelRect,
    pub score: f32,
    pub region: SquareRegion,
    pub at: UnixTime,
    /// Encoded thumbnail bytes; ownership transfers with the snapshot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<Vec<u8>>,
}

/// Projection of a tracked object carried on the event bus and mirrored into
/// persisted event rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedObjectSnapshot {
    pub id: String,
    pub camera: CamName,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_label: Option<String>,
    pub score: f32,
    pub top_score: f32,
    pub rect: PixelRect,
    pub region: SquareRegion,
    /// Zones the object currently occupies.
    pub current_zones: Vec<String>,
    /// Zones the object has entered during this track, in first-entry order.
    pub entered_zones: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stationary_since: Option<UnixTime>,
    pub false_positive: bool,
    pub has_clip: bool,
    pub has_snapshot: bool,
    pub start_time: UnixTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<UnixTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotSample>,
}

/// Lifecycle transition of a tracked object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Start,
    Update,
    End,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            EventKind::Start => "start",
            EventKind::Update => "update",
            EventKind::End => "end",
        };
        fmt.write_str(s)
    }
}

/// One message on the outbound event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub camera: CamName,
    pub data: TrackedObjectSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> TrackedObjectSnapshot {
        TrackedObjectSnapshot {
            id: "1700000000.000000-abc123".to_string(),
            camera: CamName::new("front_door"),
            label: "person".to_string(),
            sub_label: None,
            score: 0.81,
            top_score: 0.92,
            rect: PixelRect::new(100, 100, 220, 360),
            region: SquareRegion {
                x: 60,
                y: 80,
                side: 320,
            },
            current_zones: vec!["porch".to_string()],
            entered_zones: vec!["driveway".to_string(), "porch".to_string()],
            stationary_since: None,
            false_positive: false,
            has_clip: true,
            has_snapshot: false,
            start_time: UnixTime(1700000000.0),
            end_time: None,
            snapshot: None,
        }
    }

    #[test]
    fn test_event_message_wire_shape() {
        let msg = EventMessage {
            kind: EventKind::Update,
            camera: CamName::new("front_door"),
            data: snapshot(),
        };
        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "update");
        assert_eq!(value["camera"], "front_door");
        assert_eq!(value["data"]["label"], "person");
        // absent optionals are omitted, not null
        assert!(value["data"].get("end_time").is_none());
    }

    #[test]
    fn test_event_kind_roundtrip() {
        for kind in [EventKind::Start, EventKind::Update, EventKind::End] {
            let s = serde_json::to_string(&kind).unwrap();
            let back: EventKind = serde_json::from_str(&s).unwrap();
            assert_eq!(kind, back);
        }
    }
}
