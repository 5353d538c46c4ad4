//! Region-of-interest masking.
//!
//! The ROI file is produced by an external drawing tool and is read once at
//! startup: a JSON array of polygons, each an array of `[x, y]` integer pixel
//! pairs. Pixels outside every polygon are blacked out before detection.
//!
//! A pixel is covered when its integer coordinate lies inside a polygon or
//! on one of its edges, as with OpenCV's `fillPoly`: the square
//! `[2,2]..[6,6]` covers 5x5 pixels.

use anyhow::{anyhow, Context, Result};
use std::path::Path;

use crate::frame::Frame;
use crate::geometry::{Point, Polygon};

/// Ordered set of inclusion polygons. Empty means "no masking".
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegionOfInterest {
    polygons: Vec<Polygon>,
}

impl RegionOfInterest {
    pub fn new(polygons: Vec<Polygon>) -> Self {
        Self { polygons }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read ROI file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid ROI file {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let polygons: Vec<Vec<[i64; 2]>> = serde_json::from_str(raw)?;
        let polygons = polygons
            .into_iter()
            .enumerate()
            .map(|(idx, points)| {
                Polygon::new(
                    points
                        .into_iter()
                        .map(|[x, y]| Point::new(x as f64, y as f64))
                        .collect(),
                )
                .map_err(|e| anyhow!("ROI polygon #{}: {}", idx, e))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { polygons })
    }

    pub fn is_empty(&self) -> bool {
        self.polygons.is_empty()
    }

    pub fn polygons(&self) -> &[Polygon] {
        &self.polygons
    }

    /// Rasterize into a per-pixel inclusion mask for a frame size.
    pub fn rasterize(&self, width: u32, height: u32) -> RegionMask {
        let (w, h) = (width as usize, height as usize);
        let mut inside = vec![false; w * h];
        if w == 0 || h == 0 {
            return RegionMask {
                width,
                height,
                inside,
            };
        }
        let mut crossings: Vec<f64> = Vec::new();

        for poly in &self.polygons {
            let vertices = poly.vertices();
            let (y_lo, y_hi) = poly.y_range();
            if y_hi < 0.0 || y_lo > (h - 1) as f64 {
                continue;
            }
            let row_start = y_lo.ceil().max(0.0) as usize;
            let row_end = (y_hi.floor() as usize).min(h - 1);

            // Interior: even-odd spans along each integer row.
            for row in row_start..=row_end {
                let y = row as f64;
                crossings.clear();
                let mut j = vertices.len() - 1;
                for i in 0..vertices.len() {
                    let (a, b) = (vertices[i], vertices[j]);
                    if (a.y > y) != (b.y > y) {
                        crossings.push(a.x + (y - a.y) * (b.x - a.x) / (b.y - a.y));
                    }
                    j = i;
                }
                crossings.sort_by(|a, b| a.total_cmp(b));
                for span in crossings.chunks_exact(2) {
                    let end = span[1].floor();
                    if end < 0.0 {
                        continue;
                    }
                    let start = span[0].ceil().max(0.0) as usize;
                    let end = (end as usize).min(w - 1);
                    if start <= end {
                        let base = row * w;
                        inside[base + start..=base + end].fill(true);
                    }
                }
            }

            // Boundary: the half-open span rule above skips bottom and right
            // edges, so walk every edge as well.
            let mut j = vertices.len() - 1;
            for i in 0..vertices.len() {
                mark_edge(&mut inside, w, h, vertices[j], vertices[i]);
                j = i;
            }
        }

        RegionMask {
            width,
            height,
            inside,
        }
    }
}

/// Mark the pixels an edge passes through, clipped to the frame.
fn mark_edge(inside: &mut [bool], w: usize, h: usize, a: Point, b: Point) {
    let (dx, dy) = (b.x - a.x, b.y - a.y);
    let (x_max, y_max) = (w as f64 - 0.5, h as f64 - 0.5);
    // Liang-Barsky clip of the parameter range to the frame rectangle.
    let (mut t0, mut t1) = (0.0f64, 1.0f64);
    for (p, q) in [
        (-dx, a.x + 0.5),
        (dx, x_max - a.x),
        (-dy, a.y + 0.5),
        (dy, y_max - a.y),
    ] {
        if p == 0.0 {
            if q < 0.0 {
                return;
            }
            continue;
        }
        let r = q / p;
        if p < 0.0 {
            if r > t1 {
                return;
            }
            t0 = t0.max(r);
        } else {
            if r < t0 {
                return;
            }
            t1 = t1.min(r);
        }
    }

    let steps = (dx.abs().max(dy.abs()) * (t1 - t0)).ceil().max(1.0) as usize;
    for k in 0..=steps {
        let t = t0 + (t1 - t0) * k as f64 / steps as f64;
        let x = (a.x + dx * t).round();
        let y = (a.y + dy * t).round();
        if x >= 0.0 && y >= 0.0 && (x as usize) < w && (y as usize) < h {
            inside[y as usize * w + x as usize] = true;
        }
    }
}

/// Pixel mask for one frame size.
#[derive(Clone, Debug)]
pub struct RegionMask {
    width: u32,
    height: u32,
    inside: Vec<bool>,
}

impl RegionMask {
    pub fn matches(&self, frame: &Frame) -> bool {
        self.width == frame.width && self.height == frame.height
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        self.inside[y as usize * self.width as usize + x as usize]
    }

    pub fn covered_pixels(&self) -> usize {
        self.inside.iter().filter(|v| **v).count()
    }

    /// Zero every pixel outside the mask. The frame size must match.
    pub fn apply(&self, frame: &mut Frame) -> Result<()> {
        if !self.matches(frame) {
            return Err(anyhow!(
                "mask is {}x{}, frame is {}x{}",
                self.width,
                self.height,
                frame.width,
                frame.height
            ));
        }
        for (rgb, keep) in frame.pixels_mut().chunks_exact_mut(3).zip(&self.inside) {
            if !keep {
                rgb.fill(0);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_roi_file_means_no_masking() {
        let roi = RegionOfInterest::from_json("[]").unwrap();
        assert!(roi.is_empty());
    }

    #[test]
    fn short_polygon_is_rejected() {
        let err = RegionOfInterest::from_json("[[[0,0],[10,0]]]").unwrap_err();
        assert!(err.to_string().contains("ROI polygon #0"));
    }

    #[test]
    fn rasterized_square_includes_its_edges() {
        let roi = RegionOfInterest::from_json("[[[2,2],[6,2],[6,6],[2,6]]]").unwrap();
        let mask = roi.rasterize(10, 10);
        assert!(mask.contains(2, 2));
        assert!(mask.contains(5, 5));
        assert!(mask.contains(6, 6));
        assert!(mask.contains(6, 2));
        assert!(!mask.contains(7, 6));
        assert!(!mask.contains(1, 4));
        assert_eq!(mask.covered_pixels(), 25);
    }

    #[test]
    fn rasterized_triangle_includes_its_hypotenuse() {
        let roi = RegionOfInterest::from_json("[[[0,0],[4,0],[0,4]]]").unwrap();
        let mask = roi.rasterize(8, 8);
        assert!(mask.contains(2, 2));
        assert!(mask.contains(0, 4));
        assert!(!mask.contains(3, 2));
        assert_eq!(mask.covered_pixels(), 15);
    }

    #[test]
    fn polygons_outside_the_frame_are_clipped() {
        let roi = RegionOfInterest::from_json("[[[-5,-5],[3,-5],[3,3],[-5,3]]]").unwrap();
        let mask = roi.rasterize(4, 4);
        assert!(mask.contains(0, 0));
        assert!(mask.contains(3, 3));
        assert_eq!(mask.covered_pixels(), 16);

        let far = RegionOfInterest::from_json("[[[-9000000,0],[9000000,0],[0,2]]]").unwrap();
        let mask = far.rasterize(4, 4);
        assert!(mask.contains(0, 1));
        assert!(mask.contains(3, 1));
        assert!(!mask.contains(0, 3));
    }

    #[test]
    fn apply_blacks_out_pixels_outside_the_mask() {
        let roi = RegionOfInterest::from_json("[[[0,0],[2,0],[2,2],[0,2]]]").unwrap();
        let mask = roi.rasterize(4, 2);
        let mut frame = Frame::new(vec![200u8; 4 * 2 * 3], 4, 2, 0).unwrap();
        mask.apply(&mut frame).unwrap();
        assert_eq!(frame.rgb_at(1, 1), Some([200, 200, 200]));
        assert_eq!(frame.rgb_at(3, 0), Some([0, 0, 0]));
    }

    #[test]
    fn apply_rejects_mismatched_frame_size() {
        let roi = RegionOfInterest::from_json("[[[0,0],[2,0],[2,2]]]").unwrap();
        let mask = roi.rasterize(4, 4);
        let mut frame = Frame::new(vec![1u8; 12], 2, 2, 0).unwrap();
        assert!(mask.apply(&mut frame).is_err());
    }
}
