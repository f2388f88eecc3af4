//! Windowed detectors over the two fingers' feature histories.
//!
//! Each detector returns `InsufficientHistory` while either history is shorter than its window;
//! [`Signals::evaluate`] folds that into a negative reading.

use log::trace;
use serde::{Deserialize, Serialize};

use crate::displacement::{Displacement, DisplacementSample};
use crate::feature_history::FeatureHistory;
use crate::grip_error::{GripError, GripResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorTuning {
    pub contact_window: usize,
    pub contact_threshold: f64,
    pub slip_window: usize,
    pub slip_x_threshold: f64,
    pub slip_y_threshold: f64,
    pub disturbance_window: usize,
    pub disturbance_deviation: f64,
    pub disturbance_majority: usize,
    pub weight: WeightModel,
}

impl Default for DetectorTuning {
    fn default() -> Self {
        Self {
            contact_window: 2,
            contact_threshold: 0.3,
            slip_window: 5,
            slip_x_threshold: 0.5,
            slip_y_threshold: 1.0,
            disturbance_window: 5,
            disturbance_deviation: 0.5,
            disturbance_majority: 21,
            weight: WeightModel::default(),
        }
    }
}

/// Held liquid as the average of two per-finger linear fits of mean dy, plus a global offset.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightModel {
    pub right_slope: f64,
    pub right_intercept: f64,
    pub left_slope: f64,
    pub left_intercept: f64,
    pub offset: f64,
}

impl Default for WeightModel {
    fn default() -> Self {
        Self {
            right_slope: -87.558,
            right_intercept: -6.5394,
            left_slope: -102.07,
            left_intercept: 30.634,
            offset: -29.198 + 0.7,
        }
    }
}

impl WeightModel {
    pub fn estimate(&self, right_dy: f64, left_dy: f64) -> f64 {
        let right = self.right_slope * right_dy + self.right_intercept;
        let left = self.left_slope * left_dy + self.left_intercept;
        0.5 * (right + left) + self.offset
    }

    /// The model collapsed to `a * right_dy + b * left_dy + c`.
    pub fn coefficients(&self) -> (f64, f64, f64) {
        (
            0.5 * self.right_slope,
            0.5 * self.left_slope,
            0.5 * (self.right_intercept + self.left_intercept) + self.offset,
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Slip {
    pub x: bool,
    pub y: bool,
}

fn require_both(left: &FeatureHistory, right: &FeatureHistory, needed: usize) -> GripResult<()> {
    left.require(needed)?;
    right.require(needed)
}

fn mean_of_window(history: &FeatureHistory, window: usize, f: impl Fn(&DisplacementSample) -> f64) -> GripResult<f64> {
    let sum: f64 = history.newest(window)?.map(f).sum();
    Ok(sum / window.max(1) as f64)
}

fn every_in_window(history: &FeatureHistory, window: usize, f: impl Fn(&DisplacementSample) -> bool) -> GripResult<bool> {
    Ok(history.newest(window)?.all(f))
}

pub fn detect_contact(left: &FeatureHistory, right: &FeatureHistory, tuning: &DetectorTuning) -> GripResult<bool> {
    let window = tuning.contact_window.max(1);
    require_both(left, right, window)?;
    for history in [left, right] {
        let mean = mean_of_window(history, window, |s| s.mean_magnitude)?;
        if mean > tuning.contact_threshold {
            return Ok(true);
        }
    }
    Ok(false)
}

fn x_slipping(history: &FeatureHistory, tuning: &DetectorTuning) -> GripResult<bool> {
    every_in_window(history, tuning.slip_window, |s| s.mean_dx.abs() > tuning.slip_x_threshold)
}

fn y_slipping(history: &FeatureHistory, tuning: &DetectorTuning) -> GripResult<bool> {
    every_in_window(history, tuning.slip_window, |s| s.mean_dy.abs() > tuning.slip_y_threshold)
}

pub fn detect_slip(left: &FeatureHistory, right: &FeatureHistory, tuning: &DetectorTuning) -> GripResult<Slip> {
    require_both(left, right, tuning.slip_window)?;
    Ok(Slip {
        x: x_slipping(left, tuning)? && x_slipping(right, tuning)?,
        y: y_slipping(left, tuning)? && y_slipping(right, tuning)?,
    })
}

/// Both pads shear sideways, in opposite directions.
pub fn detect_twist(left: &FeatureHistory, right: &FeatureHistory, tuning: &DetectorTuning) -> GripResult<bool> {
    require_both(left, right, tuning.slip_window)?;
    if !x_slipping(left, tuning)? || !x_slipping(right, tuning)? {
        return Ok(false);
    }
    let (left_dx, right_dx) = match (left.latest(), right.latest()) {
        (Some(l), Some(r)) => (l.mean_dx, r.mean_dx),
        _ => return Ok(false),
    };
    Ok(left_dx * right_dx < 0.0)
}

/// Markers of the newest sample whose displacement strays further than the deviation
/// threshold from their average over the preceding window. Samples whose marker count doesn't
/// match the newest one are skipped.
pub fn count_deviating_markers(history: &FeatureHistory, tuning: &DetectorTuning) -> GripResult<usize> {
    let window = tuning.disturbance_window;
    history.require(window + 1)?;
    let current = history.latest().ok_or(GripError::InsufficientHistory { needed: window + 1, available: 0 })?;
    let n = current.marker_count();

    let mut sum = vec![Displacement::default(); n];
    let mut valid = 0usize;
    for past in (2..=window + 1).filter_map(|k| history.recent(k)) {
        if past.marker_count() != n {
            continue;
        }
        for (acc, d) in sum.iter_mut().zip(past.vectors()) {
            acc.dx += d.dx;
            acc.dy += d.dy;
        }
        valid += 1;
    }
    if valid == 0 {
        return Err(GripError::InsufficientHistory { needed: window + 1, available: 1 });
    }

    let count = current.vectors().iter()
        .zip(&sum)
        .filter(|(now, acc)| {
            let avg = Displacement::new(acc.dx / valid as f64, acc.dy / valid as f64);
            now.distance_to(&avg) > tuning.disturbance_deviation
        })
        .count();
    Ok(count)
}

/// `true` means small, scattered deviation (noise or vibration). Widespread deviation on
/// either finger means the object is really moving and is reported as `false`.
pub fn classify_disturbance(left: &FeatureHistory, right: &FeatureHistory, tuning: &DetectorTuning) -> GripResult<bool> {
    let left_count = count_deviating_markers(left, tuning)?;
    let right_count = count_deviating_markers(right, tuning)?;
    trace!("deviating markers: left={left_count}, right={right_count}");
    let coherent = left_count > tuning.disturbance_majority || right_count > tuning.disturbance_majority;
    Ok(!coherent)
}

pub fn estimate_weight(left: &FeatureHistory, right: &FeatureHistory, tuning: &DetectorTuning) -> GripResult<f64> {
    require_both(left, right, 1)?;
    match (left.latest(), right.latest()) {
        (Some(l), Some(r)) => Ok(tuning.weight.estimate(r.mean_dy, l.mean_dy)),
        _ => Err(GripError::InsufficientHistory { needed: 1, available: 0 }),
    }
}

/// One frame's worth of detector output, with starved detectors read as negative.
#[derive(Debug, Copy, Clone, PartialEq, Default)]
pub struct Signals {
    pub contact: bool,
    pub slip: Slip,
    pub twist: bool,
    pub disturbance: bool,
    pub weight: Option<f64>,
}

impl Signals {
    pub fn evaluate(left: &FeatureHistory, right: &FeatureHistory, tuning: &DetectorTuning) -> Self {
        let signals = Signals {
            contact: negative_if_starved("contact", detect_contact(left, right, tuning)),
            slip: negative_if_starved("slip", detect_slip(left, right, tuning)),
            twist: negative_if_starved("twist", detect_twist(left, right, tuning)),
            disturbance: negative_if_starved("disturbance", classify_disturbance(left, right, tuning)),
            weight: estimate_weight(left, right, tuning).ok(),
        };
        trace!("{signals:?}");
        signals
    }
}

fn negative_if_starved<T: Default>(name: &str, result: GripResult<T>) -> T {
    result.unwrap_or_else(|e| {
        trace!("{name}: {e}");
        T::default()
    })
}
