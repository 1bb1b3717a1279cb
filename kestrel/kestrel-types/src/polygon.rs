use serde::{Deserialize, Serialize};

/// Closed polygon over frame coordinates, used for zones and motion masks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    points: Vec<(f64, f64)>,
}

impl Polygon {
    /// Build from at least three vertices. The closing edge back to the
    /// first vertex is implicit.
    pub fn new(points: Vec<(f64, f64)>) -> Option<Polygon> {
        if points.len() < 3 {
            return None;
        }
        Some(Polygon { points })
    }

    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    /// Even-odd ray casting test. Points exactly on an edge may land on
    /// either side; zone inertia absorbs that jitter.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let mut inside = false;
        let n = self.points.len();
        let mut j = n - 1;
        for i in 0..n {
            let (xi, yi) = self.points[i];
            let (xj, yj) = self.points[j];
            if (yi > y) != (yj > y) {
                let x_cross = (xj - xi) * (y - yi) / (yj - yi) + xi;
                if x < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_square() -> Polygon {
        Polygon::new(vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)]).unwrap()
    }

    #[test]
    fn test_needs_three_points() {
        assert!(Polygon::new(vec![(0.0, 0.0), (1.0, 1.0)]).is_none());
    }

    #[test]
    fn test_square_contains() {
        let sq = unit_square();
        assert!(sq.contains(5.0, 5.0));
        assert!(sq.contains(0.5, 9.5));
        assert!(!sq.contains(-1.0, 5.0));
        assert!(!sq.contains(5.0, 11.0));
        assert!(!sq.contains(15.0, 5.0));
    }

    #[test]
    fn test_concave_polygon() {
        // a "U" shape: the notch in the middle is outside
        let u = Polygon::new(vec![
            (0.0, 0.0),
            (10.0, 0.0),
            (10.0, 10.0),
            (7.0, 10.0),
            (7.0, 3.0),
            (3.0, 3.0),
            (3.0, 10.0),
            (0.0, 10.0),
        ])
        .unwrap();
        assert!(u.contains(1.5, 8.0));
        assert!(u.contains(8.5, 8.0));
        assert!(!u.contains(5.0, 8.0));
        assert!(u.contains(5.0, 1.5));
    }
}
