//! End-to-end tracker scenario: a single synthetic object crossing the
//! frame diagonally, with zones along and away from its path.

use kestrel_track::{ObjectTracker, TrackerDelta, TrackerSettings, ZoneAnchor, ZoneDef};
use kestrel_types::{
    CamName, FrameNumber, ObjectDetection, PixelRect, Polygon, SquareRegion, UnixTime,
};

fn moving_detection(step: u64) -> ObjectDetection {
    // (0,0,100,100) to (400,400,500,500) over 20 frames
    let offset = (step * 400 / 19) as i64;
    ObjectDetection {
        label: "person".to_string(),
        score: 0.85,
        rect: PixelRect::new(offset, offset, offset + 100, offset + 100),
        region: SquareRegion {
            x: 0,
            y: 0,
            side: 640,
        },
    }
}

#[test]
fn test_single_moving_object_lifecycle_and_zones() {
    let mut settings = TrackerSettings::minimal(CamName::new("synthetic"), 1920, 1080);
    settings.zone_anchor = ZoneAnchor::BottomCenter;
    settings.zones = vec![
        // the bottom-center trajectory runs from (50,100) to (450,500)
        ZoneDef {
            name: "path".to_string(),
            polygon: Polygon::new(vec![
                (0.0, 0.0),
                (600.0, 0.0),
                (600.0, 600.0),
                (0.0, 600.0),
            ])
            .unwrap(),
            inertia: 3,
            loitering_time: 0.0,
            objects: Vec::new(),
        },
        // far corner, never visited
        ZoneDef {
            name: "far_corner".to_string(),
            polygon: Polygon::new(vec![
                (1500.0, 800.0),
                (1900.0, 800.0),
                (1900.0, 1060.0),
                (1500.0, 1060.0),
            ])
            .unwrap(),
            inertia: 1,
            loitering_time: 0.0,
            objects: Vec::new(),
        },
    ];
    let mut tracker = ObjectTracker::new(settings);

    let mut ids = std::collections::BTreeSet::new();
    let mut news = 0;
    let mut updates = 0;
    let mut last_snapshot = None;
    for step in 0..20u64 {
        let at = UnixTime(2000.0 + step as f64 * 0.2);
        let deltas = tracker.observe(FrameNumber(step + 1), at, &[moving_detection(step)]);
        for delta in deltas {
            match delta {
                TrackerDelta::New(snap) => {
                    news += 1;
                    ids.insert(snap.id.clone());
                    last_snapshot = Some(snap);
                }
                TrackerDelta::Update(snap) => {
                    updates += 1;
                    ids.insert(snap.id.clone());
                    last_snapshot = Some(snap);
                }
                TrackerDelta::Ended(_) => panic!("object ended while still visible"),
            }
        }
    }

    // exactly one object for the whole pass
    assert_eq!(news, 1);
    assert_eq!(ids.len(), 1);
    assert!(updates > 10);

    let snap = last_snapshot.unwrap();
    assert_eq!(snap.label, "person");
    assert_eq!(snap.entered_zones, vec!["path".to_string()]);
    assert!(!snap.entered_zones.contains(&"far_corner".to_string()));

    // the best snapshot was taken while the object was live and unclipped
    let best = snap.snapshot.as_ref().expect("best snapshot kept");
    assert!(best.score > 0.0);
    assert!(best.rect.x1 > 0 || best.rect.y1 > 0);
}
