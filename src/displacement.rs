//! Marker geometry and per-frame displacement samples.
//!
//! A sample always measures each marker against the pose recorded at calibration time, never
//! against the previous frame, so sensor drift accumulates visibly instead of cancelling out.

use derive_new::new;
use serde::{Deserialize, Serialize};

use crate::grip_error::{GripError, GripResult};

/// Pixel position of one marker. `x` runs along image columns, `y` along image rows.
#[derive(new, Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerPosition {
    pub x: f64,
    pub y: f64,
}

impl MarkerPosition {
    pub fn from_row_col(row: f64, col: f64) -> Self {
        Self { x: col, y: row }
    }
}

#[derive(new, Debug, Copy, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Displacement {
    pub dx: f64,
    pub dy: f64,
}

impl Displacement {
    pub fn magnitude(&self) -> f64 {
        (self.dx * self.dx + self.dy * self.dy).sqrt()
    }

    pub fn distance_to(&self, other: &Displacement) -> f64 {
        Displacement::new(self.dx - other.dx, self.dy - other.dy).magnitude()
    }
}

/// Logical marker layout of the sensor pad.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridShape {
    pub rows: usize,
    pub cols: usize,
}

impl GridShape {
    pub const GELSIGHT_MINI: GridShape = GridShape { rows: 7, cols: 9 };

    pub fn marker_count(&self) -> usize {
        self.rows * self.cols
    }
}

impl Default for GridShape {
    fn default() -> Self {
        GridShape::GELSIGHT_MINI
    }
}

/// Calibration positions for every marker, fixed once recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerReferenceSet {
    positions: Vec<MarkerPosition>,
}

impl MarkerReferenceSet {
    pub fn new(positions: Vec<MarkerPosition>) -> GripResult<Self> {
        if positions.is_empty() {
            return Err(GripError::EmptyCalibration);
        }
        Ok(Self { positions })
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn positions(&self) -> &[MarkerPosition] {
        &self.positions
    }

    /// Cumulative displacement of `current` relative to the calibration pose.
    pub fn displacements_of(&self, current: &[MarkerPosition]) -> GripResult<Vec<Displacement>> {
        if current.len() != self.positions.len() {
            return Err(GripError::TrackingUnavailable {
                tracked: current.len(),
                required: self.positions.len(),
            });
        }
        Ok(self.positions.iter()
            .zip(current)
            .map(|(origin, now)| Displacement::new(now.x - origin.x, now.y - origin.y))
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplacementSample {
    pub seq: u64,
    vectors: Vec<Displacement>,
    pub mean_magnitude: f64,
    pub mean_dx: f64,
    pub mean_dy: f64,
    grid: GridShape,
}

impl DisplacementSample {
    pub fn from_vectors(seq: u64, vectors: Vec<Displacement>, grid: GridShape) -> Self {
        let n = vectors.len().max(1) as f64;
        let mean_magnitude = vectors.iter().map(Displacement::magnitude).sum::<f64>() / n;
        let mean_dx = vectors.iter().map(|d| d.dx).sum::<f64>() / n;
        let mean_dy = vectors.iter().map(|d| d.dy).sum::<f64>() / n;
        Self { seq, vectors, mean_magnitude, mean_dx, mean_dy, grid }
    }

    pub fn vectors(&self) -> &[Displacement] {
        &self.vectors
    }

    pub fn marker_count(&self) -> usize {
        self.vectors.len()
    }

    /// The field reshaped to the sensor grid, one slice per row. `None` when the tracked marker
    /// count doesn't fill the grid exactly.
    pub fn grid_rows(&self) -> Option<Vec<&[Displacement]>> {
        if self.grid.cols == 0 || self.vectors.len() != self.grid.marker_count() {
            return None;
        }
        Some(self.vectors.chunks(self.grid.cols).collect())
    }

    pub fn stats(&self) -> DisplacementStats {
        DisplacementStats::from_magnitudes(self.vectors.iter().map(Displacement::magnitude))
    }
}

/// Max / min / mean marker displacement magnitude, in pixels.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct DisplacementStats {
    pub max: f64,
    pub min: f64,
    pub mean: f64,
    pub count: usize,
}

impl DisplacementStats {
    pub fn from_magnitudes(magnitudes: impl IntoIterator<Item = f64>) -> Self {
        let mut stats = DisplacementStats { max: f64::MIN, min: f64::MAX, mean: 0.0, count: 0 };
        let mut sum = 0.0;
        for m in magnitudes {
            stats.max = stats.max.max(m);
            stats.min = stats.min.min(m);
            sum += m;
            stats.count += 1;
        }
        if stats.count == 0 {
            return DisplacementStats { max: 0.0, min: 0.0, mean: 0.0, count: 0 };
        }
        stats.mean = sum / stats.count as f64;
        stats
    }

    pub fn merge(&self, other: &DisplacementStats) -> DisplacementStats {
        if self.count == 0 {
            return *other;
        }
        if other.count == 0 {
            return *self;
        }
        let count = self.count + other.count;
        DisplacementStats {
            max: self.max.max(other.max),
            min: self.min.min(other.min),
            mean: (self.mean * self.count as f64 + other.mean * other.count as f64) / count as f64,
            count,
        }
    }
}
