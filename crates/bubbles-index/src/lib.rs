//! Spatial pruning for bubble pair resolution.
//!
//! The resolver's pairwise sweep is O(n²); for larger populations it asks an
//! index for the circles that can actually touch a given body. Correctness
//! never depends on the index; a brute-force sweep must produce the same
//! pairs, so implementations only have to be conservative.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

/// Errors emitted by proximity index implementations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// A circle registered with the index, in containment-region coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Circle {
    pub x: f32,
    pub y: f32,
    pub radius: f32,
}

impl Circle {
    #[must_use]
    pub const fn new(x: f32, y: f32, radius: f32) -> Self {
        Self { x, y, radius }
    }
}

/// Common behaviour exposed by proximity indices.
pub trait ProximityIndex {
    /// Rebuild internal structures from the current circle set.
    fn rebuild(&mut self, circles: &[Circle]) -> Result<(), IndexError>;

    /// Visit every circle whose bounds overlap circle `idx`, passing the
    /// squared center distance. The visited set must be a superset of the
    /// truly-overlapping set restricted to candidates the grid can rule in;
    /// `idx` itself is never visited.
    fn overlaps_of(&self, idx: usize, visitor: &mut dyn FnMut(usize, OrderedFloat<f32>));
}

/// Uniform grid bucketing circles by center cell.
///
/// Query cost is proportional to local density rather than population, which
/// is what makes a 500-body sweep affordable at a few relaxation iterations
/// per frame. Cell size should be on the order of the largest diameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniformGridIndex {
    cell_size: f32,
    width: f32,
    height: f32,
    cols: usize,
    rows: usize,
    #[serde(skip)]
    cells: Vec<SmallVec<[u32; 8]>>,
    #[serde(skip)]
    circles: Vec<Circle>,
    #[serde(skip)]
    max_radius: f32,
}

impl UniformGridIndex {
    /// Create a grid covering a `width` x `height` region with square cells.
    #[must_use]
    pub fn new(cell_size: f32, width: f32, height: f32) -> Self {
        let cols = Self::axis_cells(width, cell_size);
        let rows = Self::axis_cells(height, cell_size);
        Self {
            cell_size,
            width,
            height,
            cols,
            rows,
            cells: vec![SmallVec::new(); cols * rows],
            circles: Vec::new(),
            max_radius: 0.0,
        }
    }

    fn axis_cells(extent: f32, cell_size: f32) -> usize {
        if extent <= 0.0 || cell_size <= 0.0 {
            1
        } else {
            (extent / cell_size).ceil().max(1.0) as usize
        }
    }

    /// Edge length of one grid cell.
    #[must_use]
    pub const fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Clamp a coordinate into a valid cell index along one axis.
    fn cell_coord(&self, value: f32, cells: usize) -> usize {
        if value <= 0.0 {
            return 0;
        }
        let cell = (value / self.cell_size) as usize;
        cell.min(cells - 1)
    }

    fn cell_of(&self, circle: &Circle) -> usize {
        let col = self.cell_coord(circle.x, self.cols);
        let row = self.cell_coord(circle.y, self.rows);
        row * self.cols + col
    }
}

impl ProximityIndex for UniformGridIndex {
    fn rebuild(&mut self, circles: &[Circle]) -> Result<(), IndexError> {
        if self.cell_size <= 0.0 {
            return Err(IndexError::InvalidConfig("cell_size must be positive"));
        }
        if self.width <= 0.0 || self.height <= 0.0 {
            return Err(IndexError::InvalidConfig("grid extent must be positive"));
        }
        for cell in &mut self.cells {
            cell.clear();
        }
        self.circles.clear();
        self.circles.extend_from_slice(circles);
        self.max_radius = 0.0;
        for (idx, circle) in circles.iter().enumerate() {
            self.max_radius = self.max_radius.max(circle.radius);
            let cell = self.cell_of(circle);
            self.cells[cell].push(idx as u32);
        }
        Ok(())
    }

    fn overlaps_of(&self, idx: usize, visitor: &mut dyn FnMut(usize, OrderedFloat<f32>)) {
        let Some(&circle) = self.circles.get(idx) else {
            return;
        };
        // Any overlapping partner's center lies within r + max_radius, so a
        // cell ring of that reach is conservative.
        let reach = circle.radius + self.max_radius;
        let span = (reach / self.cell_size).ceil() as isize + 1;
        let col = self.cell_coord(circle.x, self.cols) as isize;
        let row = self.cell_coord(circle.y, self.rows) as isize;
        for dr in -span..=span {
            let r = row + dr;
            if r < 0 || r >= self.rows as isize {
                continue;
            }
            for dc in -span..=span {
                let c = col + dc;
                if c < 0 || c >= self.cols as isize {
                    continue;
                }
                let cell = r as usize * self.cols + c as usize;
                for &other in &self.cells[cell] {
                    let other = other as usize;
                    if other == idx {
                        continue;
                    }
                    let partner = &self.circles[other];
                    let dx = partner.x - circle.x;
                    let dy = partner.y - circle.y;
                    let dist_sq = dx * dx + dy * dy;
                    let sum = circle.radius + partner.radius;
                    if dist_sq < sum * sum {
                        visitor(other, OrderedFloat(dist_sq));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brute_force_overlaps(circles: &[Circle], idx: usize) -> Vec<usize> {
        let mut hits = Vec::new();
        let a = circles[idx];
        for (j, b) in circles.iter().enumerate() {
            if j == idx {
                continue;
            }
            let dx = b.x - a.x;
            let dy = b.y - a.y;
            let sum = a.radius + b.radius;
            if dx * dx + dy * dy < sum * sum {
                hits.push(j);
            }
        }
        hits
    }

    fn sample_circles() -> Vec<Circle> {
        vec![
            Circle::new(50.0, 50.0, 20.0),
            Circle::new(65.0, 55.0, 15.0),
            Circle::new(400.0, 300.0, 30.0),
            Circle::new(430.0, 300.0, 10.0),
            Circle::new(790.0, 590.0, 25.0),
            Circle::new(5.0, 5.0, 12.0),
            Circle::new(52.0, 48.0, 4.0),
        ]
    }

    #[test]
    fn grid_matches_brute_force() {
        let circles = sample_circles();
        let mut grid = UniformGridIndex::new(60.0, 800.0, 600.0);
        grid.rebuild(&circles).expect("rebuild");
        for idx in 0..circles.len() {
            let mut seen = Vec::new();
            grid.overlaps_of(idx, &mut |j, _| seen.push(j));
            seen.sort_unstable();
            let mut expected = brute_force_overlaps(&circles, idx);
            expected.sort_unstable();
            assert_eq!(seen, expected, "candidate mismatch for circle {idx}");
        }
    }

    #[test]
    fn rebuild_rejects_bad_config() {
        let mut grid = UniformGridIndex::new(0.0, 800.0, 600.0);
        assert!(grid.rebuild(&[]).is_err());
        let mut grid = UniformGridIndex::new(60.0, -1.0, 600.0);
        assert!(grid.rebuild(&[]).is_err());
    }

    #[test]
    fn out_of_bounds_centers_are_clamped() {
        // Mid-frame positions can leak slightly outside the region before the
        // containment clamp runs; the grid must still accept them.
        let circles = vec![
            Circle::new(-10.0, -10.0, 20.0),
            Circle::new(2.0, 3.0, 20.0),
            Circle::new(900.0, 700.0, 15.0),
        ];
        let mut grid = UniformGridIndex::new(60.0, 800.0, 600.0);
        grid.rebuild(&circles).expect("rebuild");
        let mut seen = Vec::new();
        grid.overlaps_of(0, &mut |j, _| seen.push(j));
        assert_eq!(seen, vec![1]);
    }

    #[test]
    fn reports_squared_distance() {
        let circles = vec![Circle::new(0.0, 0.0, 10.0), Circle::new(6.0, 8.0, 10.0)];
        let mut grid = UniformGridIndex::new(40.0, 100.0, 100.0);
        grid.rebuild(&circles).expect("rebuild");
        let mut dist = None;
        grid.overlaps_of(0, &mut |j, d| {
            assert_eq!(j, 1);
            dist = Some(d.into_inner());
        });
        assert_eq!(dist, Some(100.0));
    }
}
