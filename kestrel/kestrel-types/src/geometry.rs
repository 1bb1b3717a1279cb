use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle in frame pixel coordinates.
///
/// `x2`/`y2` are exclusive, so `width = x2 - x1`. Coordinates are `i64` so
/// intermediate arithmetic (region expansion, velocity prediction) can go
/// negative before clamping back to the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x1: i64,
    pub y1: i64,
    pub x2: i64,
    pub y2: i64,
}

impl PixelRect {
    pub fn new(x1: i64, y1: i64, x2: i64, y2: i64) -> Self {
        PixelRect { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i64 {
        (self.x2 - self.x1).max(0)
    }

    pub fn height(&self) -> i64 {
        (self.y2 - self.y1).max(0)
    }

    pub fn area(&self) -> i64 {
        self.width() * self.height()
    }

    pub fn centroid(&self) -> (i64, i64) {
        ((self.x1 + self.x2) / 2, (self.y1 + self.y2) / 2)
    }

    /// Anchor used for zone membership tests on upright objects.
    pub fn bottom_center(&self) -> (i64, i64) {
        ((self.x1 + self.x2) / 2, self.y2)
    }

    pub fn intersection(&self, other: &PixelRect) -> i64 {
        let w = self.x2.min(other.x2) - self.x1.max(other.x1);
        let h = self.y2.min(other.y2) - self.y1.max(other.y1);
        if w <= 0 || h <= 0 { 0 } else { w * h }
    }

    /// Intersection over union in `[0, 1]`.
    pub fn iou(&self, other: &PixelRect) -> f64 {
        let inter = self.intersection(other);
        let union = self.area() + other.area() - inter;
        if union <= 0 {
            0.0
        } else {
            inter as f64 / union as f64
        }
    }

    pub fn clamp_to(&self, width: u32, height: u32) -> PixelRect {
        PixelRect {
            x1: self.x1.clamp(0, width as i64),
            y1: self.y1.clamp(0, height as i64),
            x2: self.x2.clamp(0, width as i64),
            y2: self.y2.clamp(0, height as i64),
        }
    }

    /// Whether any edge of the rectangle lies on the frame border.
    pub fn touches_edge(&self, width: u32, height: u32) -> bool {
        self.x1 <= 0 || self.y1 <= 0 || self.x2 >= width as i64 || self.y2 >= height as i64
    }

    pub fn translate(&self, dx: i64, dy: i64) -> PixelRect {
        PixelRect {
            x1: self.x1 + dx,
            y1: self.y1 + dy,
            x2: self.x2 + dx,
            y2: self.y2 + dy,
        }
    }
}

/// Square sub-window of a frame submitted for detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SquareRegion {
    pub x: i64,
    pub y: i64,
    pub side: i64,
}

impl SquareRegion {
    /// Square of side `side` centered on `(cx, cy)`, shifted (not shrunk) to
    /// stay inside a `width`×`height` frame. If the side exceeds a frame
    /// dimension it is capped to that dimension first.
    pub fn centered(cx: i64, cy: i64, side: i64, width: u32, height: u32) -> SquareRegion {
        let side = side.min(width as i64).min(height as i64);
        let x = (cx - side / 2).clamp(0, width as i64 - side);
        let y = (cy - side / 2).clamp(0, height as i64 - side);
        SquareRegion { x, y, side }
    }

    pub fn as_rect(&self) -> PixelRect {
        PixelRect::new(self.x, self.y, self.x + self.side, self.y + self.side)
    }

    pub fn contains_rect(&self, rect: &PixelRect) -> bool {
        let r = self.as_rect();
        rect.x1 >= r.x1 && rect.y1 >= r.y1 && rect.x2 <= r.x2 && rect.y2 <= r.y2
    }

    pub fn iou(&self, other: &SquareRegion) -> f64 {
        self.as_rect().iou(&other.as_rect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_disjoint() {
        let a = PixelRect::new(0, 0, 10, 10);
        let b = PixelRect::new(20, 20, 30, 30);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_identical() {
        let a = PixelRect::new(5, 5, 15, 25);
        assert!((a.iou(&a) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_iou_half_overlap() {
        let a = PixelRect::new(0, 0, 10, 10);
        let b = PixelRect::new(5, 0, 15, 10);
        // intersection 50, union 150
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_centered_region_clamps_to_frame() {
        let r = SquareRegion::centered(5, 5, 100, 640, 480);
        assert_eq!(r.x, 0);
        assert_eq!(r.y, 0);
        assert_eq!(r.side, 100);

        let r = SquareRegion::centered(635, 475, 100, 640, 480);
        assert_eq!(r.x, 540);
        assert_eq!(r.y, 380);
    }

    #[test]
    fn test_centered_region_caps_oversize() {
        let r = SquareRegion::centered(320, 240, 1000, 640, 480);
        assert_eq!(r.side, 480);
    }

    #[test]
    fn test_touches_edge() {
        assert!(PixelRect::new(0, 10, 20, 30).touches_edge(640, 480));
        assert!(PixelRect::new(10, 10, 640, 30).touches_edge(640, 480));
        assert!(!PixelRect::new(10, 10, 20, 30).touches_edge(640, 480));
    }
}
