//! Planar geometry in frame pixel coordinates.
//!
//! All containment tests are pure and total: degenerate shapes (zero-area
//! boxes, polygons with fewer than three vertices) contain nothing.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned box with `x1 <= x2` and `y1 <= y2`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Result<Self> {
        if ![x1, y1, x2, y2].iter().all(|v| v.is_finite()) {
            return Err(anyhow!("bbox coordinates must be finite"));
        }
        if x1 > x2 || y1 > y2 {
            return Err(anyhow!(
                "bbox corners out of order: ({}, {}) .. ({}, {})",
                x1,
                y1,
                x2,
                y2
            ));
        }
        Ok(Self { x1, y1, x2, y2 })
    }

    pub fn centroid(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn area(&self) -> f64 {
        (self.x2 - self.x1) * (self.y2 - self.y1)
    }

    pub fn contains(&self, point: Point) -> bool {
        point_in_box(point, self)
    }
}

/// Simple polygon with at least three vertices.
#[derive(Clone, Debug, PartialEq)]
pub struct Polygon {
    vertices: Vec<Point>,
}

impl Polygon {
    pub fn new(vertices: Vec<Point>) -> Result<Self> {
        if vertices.len() < 3 {
            return Err(anyhow!(
                "polygon needs at least 3 points, got {}",
                vertices.len()
            ));
        }
        if vertices.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
            return Err(anyhow!("polygon vertices must be finite"));
        }
        Ok(Self { vertices })
    }

    pub fn from_pairs(pairs: &[[f64; 2]]) -> Result<Self> {
        Self::new(pairs.iter().map(|[x, y]| Point::new(*x, *y)).collect())
    }

    pub fn vertices(&self) -> &[Point] {
        &self.vertices
    }

    pub fn contains(&self, point: Point) -> bool {
        point_in_polygon(point, &self.vertices)
    }

    /// Vertical extent, used to bound scanline rasterization.
    pub fn y_range(&self) -> (f64, f64) {
        self.vertices
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
                (lo.min(p.y), hi.max(p.y))
            })
    }
}

/// Inclusive box test. Zero-area boxes contain nothing.
pub fn point_in_box(point: Point, bbox: &BBox) -> bool {
    if bbox.x1 >= bbox.x2 || bbox.y1 >= bbox.y2 {
        return false;
    }
    point.x >= bbox.x1 && point.x <= bbox.x2 && point.y >= bbox.y1 && point.y <= bbox.y2
}

/// Even-odd ray casting test.
pub fn point_in_polygon(point: Point, vertices: &[Point]) -> bool {
    if vertices.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = vertices.len() - 1;
    for i in 0..vertices.len() {
        let (pi, pj) = (vertices[i], vertices[j]);
        if (pi.y > point.y) != (pj.y > point.y)
            && point.x < (pj.x - pi.x) * (point.y - pi.y) / (pj.y - pi.y) + pi.x
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(size: f64) -> Vec<Point> {
        vec![
            Point::new(0.0, 0.0),
            Point::new(size, 0.0),
            Point::new(size, size),
            Point::new(0.0, size),
        ]
    }

    #[test]
    fn centroid_containment_matches_box_edges() {
        let p = Point::new(5.0, 5.0);
        assert!(point_in_box(p, &BBox::new(0.0, 0.0, 10.0, 10.0).unwrap()));
        assert!(!point_in_box(p, &BBox::new(6.0, 0.0, 10.0, 10.0).unwrap()));
        // Edges are inclusive.
        assert!(point_in_box(p, &BBox::new(5.0, 5.0, 10.0, 10.0).unwrap()));
    }

    #[test]
    fn zero_area_box_contains_nothing() {
        let flat = BBox::new(0.0, 5.0, 10.0, 5.0).unwrap();
        assert!(!point_in_box(Point::new(5.0, 5.0), &flat));
        let dot = BBox::new(3.0, 3.0, 3.0, 3.0).unwrap();
        assert!(!point_in_box(Point::new(3.0, 3.0), &dot));
    }

    #[test]
    fn bbox_rejects_inverted_or_nan_corners() {
        assert!(BBox::new(10.0, 0.0, 0.0, 10.0).is_err());
        assert!(BBox::new(0.0, 10.0, 10.0, 0.0).is_err());
        assert!(BBox::new(f64::NAN, 0.0, 1.0, 1.0).is_err());
    }

    #[test]
    fn polygon_containment_handles_concave_shapes() {
        // L-shape: the notch at the top right is outside.
        let l_shape = vec![
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(10.0, 4.0),
            Point::new(4.0, 4.0),
            Point::new(4.0, 10.0),
            Point::new(0.0, 10.0),
        ];
        assert!(point_in_polygon(Point::new(2.0, 8.0), &l_shape));
        assert!(point_in_polygon(Point::new(8.0, 2.0), &l_shape));
        assert!(!point_in_polygon(Point::new(8.0, 8.0), &l_shape));
    }

    #[test]
    fn degenerate_polygons_contain_nothing() {
        let segment = vec![Point::new(0.0, 0.0), Point::new(10.0, 10.0)];
        assert!(!point_in_polygon(Point::new(5.0, 5.0), &segment));
        assert!(!point_in_polygon(Point::new(0.0, 0.0), &[]));
        assert!(Polygon::new(segment).is_err());
    }

    #[test]
    fn polygon_wrapper_delegates_to_ray_cast() {
        let poly = Polygon::new(square(10.0)).unwrap();
        assert!(poly.contains(Point::new(5.0, 5.0)));
        assert!(!poly.contains(Point::new(15.0, 5.0)));
        assert_eq!(poly.y_range(), (0.0, 10.0));
    }
}
