use std::fmt;

use derive_new::new;
use serde::{Deserialize, Serialize};

use crate::displacement::MarkerPosition;
use crate::grip_error::GripResult;

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash, Serialize, Deserialize)]
pub enum Finger {
    Left,
    Right,
}

impl fmt::Display for Finger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Finger::Left => write!(f, "left"),
            Finger::Right => write!(f, "right"),
        }
    }
}

/// One captured grayscale image. `seq` is the capture index and increases monotonically per
/// sensor.
#[derive(new, Debug, Clone, PartialEq)]
pub struct Frame {
    pub seq: u64,
    pub width: u32,
    pub height: u32,
    pub gray: Vec<u8>,
}

impl Frame {
    /// A frame that only carries its capture index, for backends that don't ship pixels.
    pub fn empty(seq: u64) -> Self {
        Frame { seq, width: 0, height: 0, gray: Vec::new() }
    }
}

/// Result of one point-correspondence step: updated positions plus a validity flag per point.
#[derive(new, Debug, Clone, PartialEq)]
pub struct TrackOutcome {
    pub points: Vec<MarkerPosition>,
    pub valid: Vec<bool>,
}

impl TrackOutcome {
    pub fn valid_points(&self) -> Vec<MarkerPosition> {
        self.points.iter()
            .zip(&self.valid)
            .filter(|(_, ok)| **ok)
            .map(|(p, _)| *p)
            .collect()
    }
}

pub trait FrameSource {
    /// Blocks until the next frame is captured. `Ok(None)` marks the end of the stream.
    fn next_frame(&mut self) -> GripResult<Option<Frame>>;
}

pub trait MarkerLocator {
    /// Initial marker centres, used once at calibration.
    fn locate(&mut self, frame: &Frame) -> GripResult<Vec<MarkerPosition>>;
}

pub trait PointTracker {
    fn track(&mut self, prev: &Frame, curr: &Frame, points: &[MarkerPosition]) -> GripResult<TrackOutcome>;
}

/// Everything one finger's sensor needs to provide.
pub struct TactileSensor {
    pub finger: Finger,
    pub source: Box<dyn FrameSource>,
    pub locator: Box<dyn MarkerLocator>,
    pub tracker: Box<dyn PointTracker>,
}

impl PointTracker for Box<dyn PointTracker> {
    fn track(&mut self, prev: &Frame, curr: &Frame, points: &[MarkerPosition]) -> GripResult<TrackOutcome> {
        (**self).track(prev, curr, points)
    }
}
