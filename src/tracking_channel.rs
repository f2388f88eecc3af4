//! Per-finger marker tracking.
//!
//! [`TrackingChannel::observe`] is the only mutator after calibration and must be called exactly
//! once per captured frame, in capture order. Every call advances the channel's notion of the
//! previous frame, whether or not correspondence succeeded, so replaying or reordering frames
//! corrupts the cumulative displacement.

use log::{debug, trace};

use crate::displacement::{DisplacementSample, DisplacementStats, GridShape, MarkerPosition, MarkerReferenceSet};
use crate::grip_error::{GripError, GripResult};
use crate::tactile_hal::{Finger, Frame, PointTracker};

pub struct TrackingChannel<T: PointTracker> {
    finger: Finger,
    tracker: T,
    grid: GridShape,
    reference: Option<MarkerReferenceSet>,
    tracked: Vec<MarkerPosition>,
    previous: Option<Frame>,
    samples_produced: u64,
    frames_dropped: u64,
    run_stats: DisplacementStats,
}

impl<T: PointTracker> TrackingChannel<T> {
    pub fn new(finger: Finger, tracker: T, grid: GridShape) -> Self {
        Self {
            finger,
            tracker,
            grid,
            reference: None,
            tracked: Vec::new(),
            previous: None,
            samples_produced: 0,
            frames_dropped: 0,
            run_stats: DisplacementStats::from_magnitudes(Vec::new()),
        }
    }

    pub fn finger(&self) -> Finger {
        self.finger
    }

    pub fn calibrate(&mut self, initial_markers: Vec<MarkerPosition>, first_frame: Frame) -> GripResult<()> {
        let reference = MarkerReferenceSet::new(initial_markers)?;
        if reference.len() != self.grid.marker_count() {
            debug!("{}: calibrated {} markers, grid expects {}", self.finger, reference.len(),
                self.grid.marker_count());
        }
        self.tracked = reference.positions().to_vec();
        self.reference = Some(reference);
        self.previous = Some(first_frame);
        self.samples_produced = 0;
        self.frames_dropped = 0;
        self.run_stats = DisplacementStats::from_magnitudes(Vec::new());
        debug!("{}: calibrated with {} markers", self.finger, self.tracked.len());
        Ok(())
    }

    pub fn is_calibrated(&self) -> bool {
        self.reference.is_some()
    }

    pub fn marker_count(&self) -> usize {
        self.reference.as_ref().map_or(0, MarkerReferenceSet::len)
    }

    /// Last successfully tracked marker positions.
    pub fn tracked_positions(&self) -> &[MarkerPosition] {
        &self.tracked
    }

    pub fn observe(&mut self, frame: Frame) -> GripResult<DisplacementSample> {
        let reference = self.reference.as_ref().ok_or(GripError::NotCalibrated)?;
        let previous = self.previous.take().ok_or(GripError::NotCalibrated)?;
        let seq = frame.seq;

        let outcome = self.tracker.track(&previous, &frame, &self.tracked);
        self.previous = Some(frame);

        let outcome = outcome?;
        let good = outcome.valid_points();
        let required = reference.len();
        if good.len() < required || outcome.points.len() != required {
            self.frames_dropped += 1;
            debug!("{}: frame {seq} dropped, {} of {required} markers validated", self.finger, good.len());
            return Err(GripError::TrackingUnavailable { tracked: good.len(), required });
        }

        let vectors = reference.displacements_of(&good)?;
        self.tracked = good;
        let sample = DisplacementSample::from_vectors(seq, vectors, self.grid);
        self.samples_produced += 1;

        let stats = sample.stats();
        self.run_stats = self.run_stats.merge(&stats);
        trace!("{}: frame {seq:4} - max {:6.2}px, min {:6.2}px, mean {:6.2}px",
            self.finger, stats.max, stats.min, stats.mean);
        Ok(sample)
    }

    pub fn samples_produced(&self) -> u64 {
        self.samples_produced
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    /// Aggregate magnitude statistics over every marker of every sample since calibration.
    pub fn run_stats(&self) -> DisplacementStats {
        self.run_stats
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::tactile_hal::TrackOutcome;

    use super::*;

    /// Moves every point by a fixed offset per frame and invalidates points on request.
    struct StepTracker {
        step: MarkerPosition,
        invalid_on: Vec<u64>,
        calls: Rc<RefCell<Vec<(u64, u64)>>>,
    }

    impl PointTracker for StepTracker {
        fn track(&mut self, prev: &Frame, curr: &Frame, points: &[MarkerPosition]) -> GripResult<TrackOutcome> {
            self.calls.borrow_mut().push((prev.seq, curr.seq));
            let moved = points.iter()
                .map(|p| MarkerPosition::new(p.x + self.step.x, p.y + self.step.y))
                .collect::<Vec<_>>();
            let mut valid = vec![true; moved.len()];
            if self.invalid_on.contains(&curr.seq) {
                valid[0] = false;
            }
            Ok(TrackOutcome::new(moved, valid))
        }
    }

    fn markers() -> Vec<MarkerPosition> {
        (0..6).map(|i| MarkerPosition::new(10.0 * i as f64, 5.0)).collect()
    }

    fn channel(invalid_on: Vec<u64>) -> (TrackingChannel<StepTracker>, Rc<RefCell<Vec<(u64, u64)>>>) {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let tracker = StepTracker { step: MarkerPosition::new(0.5, -0.25), invalid_on, calls: calls.clone() };
        (TrackingChannel::new(Finger::Left, tracker, GridShape { rows: 2, cols: 3 }), calls)
    }

    #[test]
    fn test_calibrate_rejects_empty_markers() {
        let (mut ch, _) = channel(vec![]);
        assert_eq!(ch.calibrate(vec![], Frame::empty(0)), Err(GripError::EmptyCalibration));
        assert!(!ch.is_calibrated());
    }

    #[test]
    fn test_observe_before_calibrate() {
        let (mut ch, _) = channel(vec![]);
        assert_eq!(ch.observe(Frame::empty(1)), Err(GripError::NotCalibrated));
    }

    #[test]
    fn test_displacement_is_cumulative_from_reference() {
        let (mut ch, calls) = channel(vec![]);
        ch.calibrate(markers(), Frame::empty(0)).unwrap();
        ch.observe(Frame::empty(1)).unwrap();
        ch.observe(Frame::empty(2)).unwrap();
        let third = ch.observe(Frame::empty(3)).unwrap();
        assert_eq!(third.seq, 3);
        assert!((third.mean_dx - 1.5).abs() < 1e-12);
        assert!((third.mean_dy + 0.75).abs() < 1e-12);
        assert_eq!(*calls.borrow(), vec![(0, 1), (1, 2), (2, 3)]);
        assert_eq!(ch.samples_produced(), 3);
    }

    #[test]
    fn test_failed_frame_keeps_positions_but_advances_previous_frame() {
        let (mut ch, calls) = channel(vec![2]);
        ch.calibrate(markers(), Frame::empty(0)).unwrap();
        ch.observe(Frame::empty(1)).unwrap();
        let before = ch.tracked_positions().to_vec();

        assert_eq!(
            ch.observe(Frame::empty(2)),
            Err(GripError::TrackingUnavailable { tracked: 5, required: 6 }));
        assert_eq!(ch.tracked_positions(), &before[..]);
        assert_eq!(ch.frames_dropped(), 1);

        let next = ch.observe(Frame::empty(3)).unwrap();
        assert!((next.mean_dx - 1.0).abs() < 1e-12);
        assert_eq!(calls.borrow().last(), Some(&(2, 3)));
    }
}
