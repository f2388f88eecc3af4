use log::trace;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::displacement::{Displacement, GridShape, MarkerPosition};
use crate::grip_error::GripResult;
use crate::tactile_hal::{Finger, Frame, FrameSource, MarkerLocator, PointTracker, TactileSensor, TrackOutcome};

const MARKER_PITCH_PX: f64 = 30.0;
const MARKER_ORIGIN_PX: f64 = 20.0;

/// A stretch of frames during which every marker sits at the same offset from its reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub frames: u64,
    pub offset: Displacement,
    pub noise: f64,
    pub lost_markers: usize,
}

impl Segment {
    pub fn steady(frames: u64, dx: f64, dy: f64) -> Self {
        Segment { frames, offset: Displacement::new(dx, dy), noise: 0.0, lost_markers: 0 }
    }

    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise;
        self
    }

    pub fn with_lost_markers(mut self, lost_markers: usize) -> Self {
        self.lost_markers = lost_markers;
        self
    }
}

/// Scripted displacement timeline, indexed by frame sequence number. Frame 0 is the
/// calibration frame; the timeline then plays each segment in order.
#[derive(Debug, Clone, Default)]
pub struct Scenario {
    segments: Vec<Segment>,
}

impl Scenario {
    pub fn new(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    pub fn len(&self) -> u64 {
        self.segments.iter().map(|s| s.frames).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn segment_at(&self, seq: u64) -> Option<&Segment> {
        let mut start = 1;
        for segment in &self.segments {
            if seq >= start && seq < start + segment.frames {
                return Some(segment);
            }
            start += segment.frames;
        }
        None
    }

    /// Demo timeline: a bottle is pushed between the fingers, held while it is filled (the pad
    /// jitters while water pours in), twisted, starts sliding down, then is pulled out sideways.
    pub fn water_bottle(finger: Finger) -> Self {
        let twist_sign = match finger {
            Finger::Left => 1.0,
            Finger::Right => -1.0,
        };
        Scenario::new(vec![
            Segment::steady(10, 0.0, 0.0).with_noise(0.02),
            Segment::steady(40, 0.2, 0.4).with_noise(0.05),
            Segment::steady(2, 0.2, 0.4).with_lost_markers(3),
            Segment::steady(60, 0.2, -0.3).with_noise(0.6),
            Segment::steady(40, 0.3, -0.6).with_noise(0.05),
            Segment::steady(8, 0.8 * twist_sign, -0.6),
            Segment::steady(30, 0.2, -0.8).with_noise(0.6),
            Segment::steady(12, 0.2, -1.4).with_noise(0.6),
            Segment::steady(20, 1.2, -0.8),
            Segment::steady(30, 0.0, 0.0).with_noise(0.02),
        ])
    }
}

pub struct SyntheticFrameSource {
    next_seq: u64,
    last_seq: u64,
}

impl SyntheticFrameSource {
    pub fn new(scenario_len: u64) -> Self {
        Self { next_seq: 0, last_seq: scenario_len }
    }
}

impl FrameSource for SyntheticFrameSource {
    fn next_frame(&mut self) -> GripResult<Option<Frame>> {
        if self.next_seq > self.last_seq {
            return Ok(None);
        }
        let frame = Frame::empty(self.next_seq);
        self.next_seq += 1;
        Ok(Some(frame))
    }
}

pub struct GridMarkerLocator {
    grid: GridShape,
}

impl GridMarkerLocator {
    pub fn new(grid: GridShape) -> Self {
        Self { grid }
    }

    pub fn reference(&self) -> Vec<MarkerPosition> {
        (0..self.grid.rows)
            .flat_map(|row| (0..self.grid.cols).map(move |col| MarkerPosition::from_row_col(
                MARKER_ORIGIN_PX + row as f64 * MARKER_PITCH_PX,
                MARKER_ORIGIN_PX + col as f64 * MARKER_PITCH_PX)))
            .collect()
    }
}

impl MarkerLocator for GridMarkerLocator {
    fn locate(&mut self, _frame: &Frame) -> GripResult<Vec<MarkerPosition>> {
        Ok(self.reference())
    }
}

/// Answers correspondence queries straight from the scenario instead of from pixels.
pub struct ScenarioTracker {
    reference: Vec<MarkerPosition>,
    scenario: Scenario,
    rng: StdRng,
}

impl ScenarioTracker {
    pub fn new(reference: Vec<MarkerPosition>, scenario: Scenario, seed: u64) -> Self {
        Self { reference, scenario, rng: StdRng::seed_from_u64(seed) }
    }
}

impl PointTracker for ScenarioTracker {
    fn track(&mut self, _prev: &Frame, curr: &Frame, points: &[MarkerPosition]) -> GripResult<TrackOutcome> {
        let segment = match self.scenario.segment_at(curr.seq) {
            Some(segment) => segment.clone(),
            None => Segment::steady(1, 0.0, 0.0),
        };
        let mut moved = Vec::with_capacity(points.len());
        for origin in self.reference.iter().take(points.len()) {
            let (jx, jy) = if segment.noise > 0.0 {
                (self.rng.gen_range(-segment.noise..segment.noise),
                 self.rng.gen_range(-segment.noise..segment.noise))
            } else {
                (0.0, 0.0)
            };
            moved.push(MarkerPosition::new(
                origin.x + segment.offset.dx + jx,
                origin.y + segment.offset.dy + jy));
        }
        let valid = (0..moved.len()).map(|i| i >= segment.lost_markers).collect();
        trace!("synthetic frame {}: offset {:?}", curr.seq, segment.offset);
        Ok(TrackOutcome::new(moved, valid))
    }
}

pub fn synthetic_sensor(finger: Finger, grid: GridShape, scenario: Scenario, seed: u64) -> TactileSensor {
    let locator = GridMarkerLocator::new(grid);
    let reference = locator.reference();
    TactileSensor {
        finger,
        source: Box::new(SyntheticFrameSource::new(scenario.len())),
        locator: Box::new(locator),
        tracker: Box::new(ScenarioTracker::new(reference, scenario, seed)),
    }
}
