//! Offline backend that replays marker tracks recorded from a real sensor.
//!
//! A recording holds the calibration marker centres (frame 0) followed by the tracked position
//! of every marker for each subsequent frame, so the controller can be exercised without a
//! camera or an optical-flow implementation.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::rc::Rc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::displacement::MarkerPosition;
use crate::grip_error::{GripError, GripResult};
use crate::tactile_hal::{Finger, Frame, FrameSource, MarkerLocator, PointTracker, TactileSensor, TrackOutcome};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedFrame {
    pub points: Vec<MarkerPosition>,
    #[serde(default)]
    pub valid: Option<Vec<bool>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub reference: Vec<MarkerPosition>,
    pub frames: Vec<RecordedFrame>,
}

impl Recording {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("opening recording {}", path.display()))?;
        let reader = BufReader::new(file);
        let recording: Recording = serde_json::from_reader(reader)
            .with_context(|| format!("parsing recording {}", path.display()))?;
        Ok(recording)
    }

    fn frame(&self, seq: u64) -> Option<&RecordedFrame> {
        let index = usize::try_from(seq.checked_sub(1)?).ok()?;
        self.frames.get(index)
    }
}

struct ReplayFrameSource {
    next_seq: u64,
    frame_count: u64,
}

impl FrameSource for ReplayFrameSource {
    fn next_frame(&mut self) -> GripResult<Option<Frame>> {
        if self.next_seq > self.frame_count {
            return Ok(None);
        }
        let frame = Frame::empty(self.next_seq);
        self.next_seq += 1;
        Ok(Some(frame))
    }
}

struct ReplayLocator {
    recording: Rc<Recording>,
}

impl MarkerLocator for ReplayLocator {
    fn locate(&mut self, _frame: &Frame) -> GripResult<Vec<MarkerPosition>> {
        Ok(self.recording.reference.clone())
    }
}

struct ReplayTracker {
    recording: Rc<Recording>,
}

impl PointTracker for ReplayTracker {
    fn track(&mut self, _prev: &Frame, curr: &Frame, points: &[MarkerPosition]) -> GripResult<TrackOutcome> {
        let recorded = self.recording.frame(curr.seq).ok_or(GripError::TrackingUnavailable {
            tracked: 0,
            required: points.len(),
        })?;
        let valid = recorded.valid.clone().unwrap_or_else(|| vec![true; recorded.points.len()]);
        Ok(TrackOutcome::new(recorded.points.clone(), valid))
    }
}

pub fn replay_sensor(finger: Finger, recording: Recording) -> TactileSensor {
    let frame_count = recording.frames.len() as u64;
    let recording = Rc::new(recording);
    TactileSensor {
        finger,
        source: Box::new(ReplayFrameSource { next_seq: 0, frame_count }),
        locator: Box::new(ReplayLocator { recording: recording.clone() }),
        tracker: Box::new(ReplayTracker { recording }),
    }
}
