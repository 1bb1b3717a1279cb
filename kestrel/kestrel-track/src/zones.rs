use serde::{Deserialize, Serialize};

use kestrel_types::{PixelRect, Polygon};

/// Which point of a bounding box is tested against zone polygons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneAnchor {
    Centroid,
    /// Where upright objects touch the ground; the default.
    #[default]
    BottomCenter,
}

impl ZoneAnchor {
    pub fn point(&self, rect: &PixelRect) -> (i64, i64) {
        match self {
            ZoneAnchor::Centroid => rect.centroid(),
            ZoneAnchor::BottomCenter => rect.bottom_center(),
        }
    }
}

/// One configured zone, with its polygon precomputed at detect resolution.
#[derive(Debug, Clone)]
pub struct ZoneDef {
    pub name: String,
    pub polygon: Polygon,
    /// Continuous frames inside before the zone counts as entered.
    pub inertia: u32,
    /// Seconds of continuous presence before loitering; zero disables.
    pub loitering_time: f64,
    /// Labels the zone applies to; empty means all.
    pub objects: Vec<String>,
}

impl ZoneDef {
    pub fn applies_to(&self, label: &str) -> bool {
        self.objects.is_empty() || self.objects.iter().any(|l| l == label)
    }
}
