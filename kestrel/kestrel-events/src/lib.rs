//! Event lifecycle derivation.
//!
//! Consumes tracker deltas and turns them into the `start` / `update` /
//! `end` messages that go to the outbound bus and the persisted event rows.
//! Per tracked-object id the emitted sequence is always
//! `start update* end?`; an id whose end was emitted is never reopened.

use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;
use tracing::{debug, warn};

use kestrel_track::TrackerDelta;
use kestrel_types::{CamName, EventKind, EventMessage, TrackedObjectSnapshot, UnixTime};

/// Minimum spacing between update emissions for one object, unless its
/// end_time changed.
pub const UPDATE_THROTTLE_SECS: f64 = 2.0;

/// Closed ids remembered to guard against reopening.
const CLOSED_ID_MEMORY: usize = 1024;

#[derive(Debug, Clone, Copy)]
pub struct EventSettings {
    /// Seconds of recording preserved before the first detection.
    pub pre_capture: f64,
    /// Seconds appended after the last observation.
    pub post_capture: f64,
}

impl Default for EventSettings {
    fn default() -> Self {
        EventSettings {
            pre_capture: 5.0,
            post_capture: 5.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EventCounters {
    pub started: u64,
    pub updated: u64,
    pub ended: u64,
    pub suppressed_updates: u64,
    pub orphan_deltas: u64,
}

/// Fields whose change triggers an update emission.
#[derive(Debug, Clone, PartialEq)]
struct WatchedFields {
    top_score: f32,
    entered_zones: Vec<String>,
    snapshot_at: Option<UnixTime>,
    end_time: Option<UnixTime>,
    has_clip: bool,
    has_snapshot: bool,
}

impl WatchedFields {
    fn of(snapshot: &TrackedObjectSnapshot) -> WatchedFields {
        WatchedFields {
            top_score: snapshot.top_score,
            entered_zones: snapshot.entered_zones.clone(),
            snapshot_at: snapshot.snapshot.as_ref().map(|s| s.at),
            end_time: snapshot.end_time,
            has_clip: snapshot.has_clip,
            has_snapshot: snapshot.has_snapshot,
        }
    }
}

struct LiveEvent {
    last_emitted: WatchedFields,
    last_update_at: UnixTime,
    /// Sticky media flags; once true they never fall back to false even if
    /// a later snapshot disagrees.
    has_clip: bool,
    has_snapshot: bool,
    last_snapshot: TrackedObjectSnapshot,
}

pub struct EventEngine {
    cameras: BTreeMap<CamName, EventSettings>,
    live: BTreeMap<String, LiveEvent>,
    closed: VecDeque<String>,
    counters: EventCounters,
}

impl Default for EventEngine {
    fn default() -> Self {
        EventEngine::new()
    }
}

impl EventEngine {
    pub fn new() -> EventEngine {
        EventEngine {
            cameras: BTreeMap::new(),
            live: BTreeMap::new(),
            closed: VecDeque::new(),
            counters: EventCounters::default(),
        }
    }

    pub fn register_camera(&mut self, camera: CamName, settings: EventSettings) {
        self.cameras.insert(camera, settings);
    }

    pub fn counters(&self) -> EventCounters {
        self.counters
    }

    fn settings_for(&self, camera: &CamName) -> EventSettings {
        self.cameras.get(camera).copied().unwrap_or_default()
    }

    /// Mark the recorder's clip as available for an event. Takes effect on
    /// the next emission for that id.
    pub fn note_clip(&mut self, id: &str) {
        if let Some(event) = self.live.get_mut(id) {
            event.has_clip = true;
        }
    }

    /// Mark a saved snapshot for an event.
    pub fn note_snapshot(&mut self, id: &str) {
        if let Some(event) = self.live.get_mut(id) {
            event.has_snapshot = true;
        }
    }

    /// Process one tracker delta, yielding zero or one bus message.
    pub fn handle(&mut self, at: UnixTime, delta: TrackerDelta) -> Option<EventMessage> {
        match delta {
            TrackerDelta::New(snapshot) => self.handle_new(at, snapshot),
            TrackerDelta::Update(snapshot) => self.handle_update(at, snapshot),
            TrackerDelta::Ended(snapshot) => self.handle_end(snapshot),
        }
    }

    fn handle_new(&mut self, at: UnixTime, snapshot: TrackedObjectSnapshot) -> Option<EventMessage> {
        if self.closed.contains(&snapshot.id) {
            warn!(id = %snapshot.id, "ignoring start for an already-ended event");
            self.counters.orphan_deltas += 1;
            return None;
        }
        let settings = self.settings_for(&snapshot.camera);
        let mut outgoing = snapshot.clone();
        outgoing.start_time = outgoing.start_time.offset(-settings.pre_capture);

        self.live.insert(
            snapshot.id.clone(),
            LiveEvent {
                last_emitted: WatchedFields::of(&outgoing),
                last_update_at: at,
                has_clip: snapshot.has_clip,
                has_snapshot: snapshot.has_snapshot,
                last_snapshot: snapshot.clone(),
            },
        );
        self.counters.started += 1;
        Some(EventMessage {
            kind: EventKind::Start,
            camera: snapshot.camera,
            data: outgoing,
        })
    }

    fn handle_update(
        &mut self,
        at: UnixTime,
        snapshot: TrackedObjectSnapshot,
    ) -> Option<EventMessage> {
        let settings = self.settings_for(&snapshot.camera);
        let Some(event) = self.live.get_mut(&snapshot.id) else {
            self.counters.orphan_deltas += 1;
            debug!(id = %snapshot.id, "update for unknown event dropped");
            return None;
        };

        // media flags are sticky for the lifetime of the object
        event.has_clip |= snapshot.has_clip;
        event.has_snapshot |= snapshot.has_snapshot;

        let mut outgoing = snapshot.clone();
        outgoing.start_time = outgoing.start_time.offset(-settings.pre_capture);
        outgoing.has_clip = event.has_clip;
        outgoing.has_snapshot = event.has_snapshot;

        let fields = WatchedFields::of(&outgoing);
        if fields == event.last_emitted {
            event.last_snapshot = snapshot;
            return None;
        }
        let end_changed = fields.end_time != event.last_emitted.end_time;
        if !end_changed && at.since(event.last_update_at) < UPDATE_THROTTLE_SECS {
            self.counters.suppressed_updates += 1;
            event.last_snapshot = snapshot;
            return None;
        }

        event.last_emitted = fields;
        event.last_update_at = at;
        event.last_snapshot = snapshot.clone();
        self.counters.updated += 1;
        Some(EventMessage {
            kind: EventKind::Update,
            camera: snapshot.camera,
            data: outgoing,
        })
    }

    fn handle_end(&mut self, snapshot: TrackedObjectSnapshot) -> Option<EventMessage> {
        let settings = self.settings_for(&snapshot.camera);
        let Some(event) = self.live.remove(&snapshot.id) else {
            self.counters.orphan_deltas += 1;
            debug!(id = %snapshot.id, "end for unknown event dropped");
            return None;
        };
        self.remember_closed(snapshot.id.clone());

        let mut outgoing = snapshot.clone();
        outgoing.start_time = outgoing.start_time.offset(-settings.pre_capture);
        outgoing.end_time = Some(
            outgoing
                .end_time
                .unwrap_or(snapshot.start_time)
                .offset(settings.post_capture),
        );
        outgoing.has_clip = event.has_clip | snapshot.has_clip;
        outgoing.has_snapshot = event.has_snapshot | snapshot.has_snapshot;

        self.counters.ended += 1;
        Some(EventMessage {
            kind: EventKind::End,
            camera: snapshot.camera,
            data: outgoing,
        })
    }

    /// End every live event (shutdown path), stamping `at` as the end time.
    pub fn close_all(&mut self, at: UnixTime) -> Vec<EventMessage> {
        let ids: Vec<String> = self.live.keys().cloned().collect();
        let mut messages = Vec::new();
        for id in ids {
            let event = self.live.get(&id).expect("id just listed");
            let mut snapshot = event.last_snapshot.clone();
            snapshot.end_time = Some(at);
            if let Some(message) = self.handle_end(snapshot) {
                messages.push(message);
            }
        }
        messages
    }

    fn remember_closed(&mut self, id: String) {
        if self.closed.len() == CLOSED_ID_MEMORY {
            self.closed.pop_front();
        }
        self.closed.push_back(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_types::{PixelRect, SquareRegion};

    fn snapshot(id: &str, at: f64) -> TrackedObjectSnapshot {
        TrackedObjectSnapshot {
            id: id.to_string(),
            camera: CamName::new("front"),
            label: "person".to_string(),
            sub_label: None,
            score: 0.8,
            top_score: 0.8,
            rect: PixelRect::new(100, 100, 200, 300),
            region: SquareRegion {
                x: 0,
                y: 0,
                side: 320,
            },
            current_zones: Vec::new(),
            entered_zones: Vec::new(),
            stationary_since: None,
            false_positive: false,
            has_clip: false,
            has_snapshot: false,
            start_time: UnixTime(at),
            end_time: None,
            snapshot: None,
        }
    }

    fn engine() -> EventEngine {
        let mut engine = EventEngine::new();
        engine.register_camera(
            CamName::new("front"),
            EventSettings {
                pre_capture: 5.0,
                post_capture: 5.0,
            },
        );
        engine
    }

    #[test]
    fn test_start_applies_pre_capture() {
        let mut engine = engine();
        let message = engine
            .handle(UnixTime(1000.0), TrackerDelta::New(snapshot("a", 1000.0)))
            .unwrap();
        assert_eq!(message.kind, EventKind::Start);
        assert_eq!(message.data.start_time, UnixTime(995.0));
    }

    #[test]
    fn test_end_applies_post_capture() {
        let mut engine = engine();
        engine.handle(UnixTime(1000.0), TrackerDelta::New(snapshot("a", 1000.0)));
        let mut ending = snapshot("a", 1000.0);
        ending.end_time = Some(UnixTime(1010.0));
        let message = engine
            .handle(UnixTime(1011.0), TrackerDelta::Ended(ending))
            .unwrap();
        assert_eq!(message.kind, EventKind::End);
        assert_eq!(message.data.end_time, Some(UnixTime(1015.0)));
        assert_eq!(message.data.start_time, UnixTime(995.0));
    }

    #[test]
    fn test_updates_throttled_to_two_seconds() {
        let mut engine = engine();
        engine.handle(UnixTime(1000.0), TrackerDelta::New(snapshot("a", 1000.0)));

        // a change right away is suppressed by the throttle
        let mut changed = snapshot("a", 1000.0);
        changed.top_score = 0.9;
        assert!(engine
            .handle(UnixTime(1000.5), TrackerDelta::Update(changed.clone()))
            .is_none());
        assert_eq!(engine.counters().suppressed_updates, 1);

        // the same change clears the throttle window later
        let message = engine
            .handle(UnixTime(1003.0), TrackerDelta::Update(changed))
            .unwrap();
        assert_eq!(message.kind, EventKind::Update);
        assert_eq!(message.data.top_score, 0.9);
    }

    #[test]
    fn test_unchanged_update_not_emitted() {
        let mut engine = engine();
        engine.handle(UnixTime(1000.0), TrackerDelta::New(snapshot("a", 1000.0)));
        assert!(engine
            .handle(UnixTime(1005.0), TrackerDelta::Update(snapshot("a", 1000.0)))
            .is_none());
        assert_eq!(engine.counters().updated, 0);
    }

    #[test]
    fn test_zone_change_triggers_update() {
        let mut engine = engine();
        engine.handle(UnixTime(1000.0), TrackerDelta::New(snapshot("a", 1000.0)));
        let mut entered = snapshot("a", 1000.0);
        entered.entered_zones = vec!["porch".to_string()];
        let message = engine
            .handle(UnixTime(1003.0), TrackerDelta::Update(entered))
            .unwrap();
        assert_eq!(message.data.entered_zones, vec!["porch".to_string()]);
    }

    #[test]
    fn test_media_flags_are_sticky() {
        let mut engine = engine();
        engine.handle(UnixTime(1000.0), TrackerDelta::New(snapshot("a", 1000.0)));
        engine.note_clip("a");
        engine.note_snapshot("a");

        // the incoming snapshot still says false; the emitted one must not
        let message = engine
            .handle(UnixTime(1003.0), TrackerDelta::Update(snapshot("a", 1000.0)))
            .unwrap();
        assert!(message.data.has_clip);
        assert!(message.data.has_snapshot);

        let mut ending = snapshot("a", 1000.0);
        ending.end_time = Some(UnixTime(1010.0));
        let message = engine
            .handle(UnixTime(1011.0), TrackerDelta::Ended(ending))
            .unwrap();
        assert!(message.data.has_clip);
        assert!(message.data.has_snapshot);
    }

    #[test]
    fn test_sequence_is_start_update_end_and_never_reopens() {
        let mut engine = engine();
        let mut kinds = Vec::new();
        if let Some(m) = engine.handle(UnixTime(1000.0), TrackerDelta::New(snapshot("a", 1000.0)))
        {
            kinds.push(m.kind);
        }
        let mut changed = snapshot("a", 1000.0);
        changed.top_score = 0.95;
        if let Some(m) = engine.handle(UnixTime(1003.0), TrackerDelta::Update(changed)) {
            kinds.push(m.kind);
        }
        let mut ending = snapshot("a", 1000.0);
        ending.end_time = Some(UnixTime(1004.0));
        if let Some(m) = engine.handle(UnixTime(1005.0), TrackerDelta::Ended(ending)) {
            kinds.push(m.kind);
        }
        assert_eq!(
            kinds,
            vec![EventKind::Start, EventKind::Update, EventKind::End]
        );

        // anything after the end for this id is dropped
        assert!(engine
            .handle(UnixTime(1006.0), TrackerDelta::Update(snapshot("a", 1000.0)))
            .is_none());
        assert!(engine
            .handle(UnixTime(1007.0), TrackerDelta::New(snapshot("a", 1000.0)))
            .is_none());
        assert_eq!(engine.counters().orphan_deltas, 2);
    }

    #[test]
    fn test_close_all_ends_live_events() {
        let mut engine = engine();
        engine.handle(UnixTime(1000.0), TrackerDelta::New(snapshot("a", 1000.0)));
        engine.handle(UnixTime(1000.0), TrackerDelta::New(snapshot("b", 1000.0)));
        let messages = engine.close_all(UnixTime(1042.0));
        assert_eq!(messages.len(), 2);
        for message in &messages {
            assert_eq!(message.kind, EventKind::End);
            assert_eq!(message.data.end_time, Some(UnixTime(1047.0)));
        }
    }
}
