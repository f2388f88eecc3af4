//! The per-frame loop: both fingers' tracking, detectors, controller, then at most one gripper
//! command.

use std::path::Path;
use std::thread;

use anyhow::{anyhow, bail, Context};
use log::{debug, error, info, warn};

use crate::feature_history::FeatureHistory;
use crate::grasp_config::GraspTuning;
use crate::grasp_controller::{log_phase_change, GraspController, GraspState, Intent, ReleaseReason, StallCause};
use crate::grip_error::GripResult;
use crate::gripper_hal::{GripperHal, SaveOutcome};
use crate::gripper_registers::ControlMode;
use crate::signal_detectors::Signals;
use crate::tactile_hal::{Finger, FrameSource, MarkerLocator, PointTracker, TactileSensor};
use crate::tracking_channel::TrackingChannel;

/// One finger's sensor feeding its tracking channel and history.
struct FingerPipeline {
    source: Box<dyn FrameSource>,
    locator: Box<dyn MarkerLocator>,
    channel: TrackingChannel<Box<dyn PointTracker>>,
    history: FeatureHistory,
}

impl FingerPipeline {
    fn new(sensor: TactileSensor, tuning: &GraspTuning) -> Self {
        Self {
            source: sensor.source,
            locator: sensor.locator,
            channel: TrackingChannel::new(sensor.finger, sensor.tracker, tuning.grid),
            history: FeatureHistory::with_capacity(tuning.history_capacity),
        }
    }

    fn finger(&self) -> Finger {
        self.channel.finger()
    }

    fn calibrate(&mut self) -> anyhow::Result<()> {
        let frame = self.source.next_frame()?
            .ok_or_else(|| anyhow!("{}: no frame to calibrate from", self.finger()))?;
        let markers = self.locator.locate(&frame)?;
        self.channel.calibrate(markers, frame)?;
        self.history.clear();
        Ok(())
    }

    /// Observes the next frame. `None` at the end of the stream, otherwise whether a sample was
    /// appended.
    fn advance(&mut self) -> GripResult<Option<bool>> {
        let frame = match self.source.next_frame()? {
            Some(frame) => frame,
            None => return Ok(None),
        };
        match self.channel.observe(frame) {
            Ok(sample) => {
                self.history.push(sample);
                Ok(Some(true))
            }
            Err(e) if e.is_recoverable() => {
                debug!("{}: {e}", self.finger());
                Ok(Some(false))
            }
            Err(e) => Err(e),
        }
    }

    fn report(&self) {
        if let Some(latest) = self.history.latest() {
            info!("{}: mean dx {:.3}, mean dy {:.3}", self.finger(), latest.mean_dx, latest.mean_dy);
        }
        let stats = self.channel.run_stats();
        debug!("{}: {} samples, {} dropped, magnitude max {:.2} min {:.2} mean {:.2}",
            self.finger(), self.channel.samples_produced(), self.channel.frames_dropped(),
            stats.max, stats.min, stats.mean);
    }
}

#[derive(Debug, PartialEq, Copy, Clone)]
pub enum Tick {
    Frame(Intent),
    EndOfStream,
}

#[derive(Debug, Default, PartialEq, Clone)]
pub struct RunSummary {
    pub frames: u64,
    pub grips: u32,
    pub releases: u32,
    pub weight_reports: u32,
    pub last_weight: Option<f64>,
    pub actuation_failures: u32,
}

pub struct GraspRunner {
    gripper: Box<dyn GripperHal>,
    left: FingerPipeline,
    right: FingerPipeline,
    controller: GraspController,
    tuning: GraspTuning,
    state: GraspState,
    consecutive_failures: u32,
    summary: RunSummary,
}

impl GraspRunner {
    /// `state` resumes a saved controller state; otherwise we start fresh at the configured
    /// grip current.
    pub fn new(
        gripper: Box<dyn GripperHal>,
        sensors: (TactileSensor, TactileSensor),
        tuning: GraspTuning,
        state: Option<GraspState>,
    ) -> Self {
        let (left, right) = sensors;
        let state = state.unwrap_or_else(|| GraspState::new(tuning.initial_grip_current));
        Self {
            gripper,
            left: FingerPipeline::new(left, &tuning),
            right: FingerPipeline::new(right, &tuning),
            controller: GraspController::new(tuning.controller.clone()),
            tuning,
            state,
            consecutive_failures: 0,
            summary: RunSummary::default(),
        }
    }

    pub fn state(&self) -> &GraspState {
        &self.state
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Puts the gripper into serial control with our current and speed, open.
    pub fn prepare_gripper(&mut self) -> anyhow::Result<()> {
        self.gripper.test_connection().context("Gripper not responding")?;
        self.gripper.set_control_mode(ControlMode::Serial)?;
        self.gripper.set_grip_current(self.state.grip_current)?;
        self.gripper.set_grip_speed(self.tuning.grip_speed)?;
        self.gripper.release()?;
        if self.gripper.save_config()? == SaveOutcome::Unconfirmed {
            warn!("Gripper config save unconfirmed, continuing");
        }
        Ok(())
    }

    /// Calibrates both fingers, then observes the warm-up frames without driving the gripper.
    pub fn calibrate(&mut self) -> anyhow::Result<()> {
        self.left.calibrate()?;
        self.right.calibrate()?;
        for _ in 0..self.tuning.warmup_frames {
            let left = self.left.advance()?;
            let right = self.right.advance()?;
            if left.is_none() || right.is_none() {
                bail!("Sensor stream ended during warm-up");
            }
        }
        info!("Sensors calibrated, {} warm-up frames observed", self.tuning.warmup_frames);
        Ok(())
    }

    pub fn tick(&mut self) -> anyhow::Result<Tick> {
        let left = self.left.advance()?;
        let right = self.right.advance()?;
        if left.is_none() || right.is_none() {
            return Ok(Tick::EndOfStream);
        }
        self.summary.frames += 1;
        if left == Some(false) && right == Some(false) {
            debug!("No new samples this frame, holding");
            return Ok(Tick::Frame(Intent::Hold));
        }

        let signals = Signals::evaluate(&self.left.history, &self.right.history, &self.tuning.detectors);
        let (next, intent) = self.controller.step(self.state, &signals);

        match self.execute(intent) {
            Ok(()) => {
                log_phase_change(self.state.phase, next.phase);
                self.state = next;
                self.consecutive_failures = 0;
                self.tally(intent);
            }
            Err(e) => {
                self.summary.actuation_failures += 1;
                self.consecutive_failures += 1;
                error!("{intent:?} failed ({}/{}): {e}", self.consecutive_failures,
                    self.tuning.max_consecutive_failures);
                if self.consecutive_failures >= self.tuning.max_consecutive_failures {
                    bail!("Giving up after {} consecutive gripper failures: {e}", self.consecutive_failures);
                }
            }
        }

        if self.tuning.report_interval > 0 && self.summary.frames % self.tuning.report_interval == 0 {
            self.left.report();
            self.right.report();
        }
        Ok(Tick::Frame(intent))
    }

    fn execute(&mut self, intent: Intent) -> GripResult<()> {
        let delays = &self.tuning.delays;
        match intent {
            Intent::Hold => {}
            Intent::Grip => {
                self.gripper.grip()?;
                thread::sleep(delays.grip_settle());
            }
            Intent::AwaitGripConfirmation { frame } => {
                debug!("Waiting for grip confirmation ({frame}/{})", self.controller.tuning().validation_frames);
                thread::sleep(delays.validation_poll());
            }
            Intent::GripConfirmed => info!("Grip successful"),
            Intent::Release(reason) => {
                self.gripper.release()?;
                match reason {
                    ReleaseReason::ContactLost => info!("No contact detected, released"),
                    ReleaseReason::GripNotConfirmed => {
                        info!("Grip failed, nothing detected; released");
                        thread::sleep(delays.failed_grip_release());
                    }
                    ReleaseReason::SlipX => {
                        warn!("X-direction slip detected, released");
                        thread::sleep(delays.slip_recovery());
                    }
                }
            }
            Intent::RaiseGripCurrent(current) => {
                self.gripper.set_grip_current(current)?;
                warn!("Continuous slipping, grip current raised to {current} for the next grip");
            }
            Intent::SlipWarning { count } => {
                warn!("Slipping! Stop adding water ({count}/{})", self.controller.tuning().y_slip_warning_cap);
            }
            Intent::SlipAtMaxCurrent => warn!("Continuous slipping, grip current already at maximum"),
            Intent::Stall { cause, warn: true } => match cause {
                StallCause::Twist => warn!("Rolling, waiting for stability"),
                StallCause::Disturbance => debug!("Disturbance, waiting for stability"),
            },
            Intent::Stall { warn: false, .. } => {}
            Intent::ReportWeight(weight) => info!("Liquid level: {weight:.1}"),
        }
        Ok(())
    }

    fn tally(&mut self, intent: Intent) {
        match intent {
            Intent::Grip => self.summary.grips += 1,
            Intent::Release(_) => self.summary.releases += 1,
            Intent::ReportWeight(weight) => {
                self.summary.weight_reports += 1;
                self.summary.last_weight = Some(weight);
            }
            _ => {}
        }
    }

    /// Runs until the sensors run dry, `max_frames` is reached, or the gripper keeps failing.
    /// The controller state is saved on the way out either way.
    pub fn run(mut self, max_frames: Option<u64>, state_out: Option<impl AsRef<Path>>) -> anyhow::Result<RunSummary> {
        let result = loop {
            if max_frames.map_or(false, |max| self.summary.frames >= max) {
                break Ok(());
            }
            match self.tick() {
                Ok(Tick::EndOfStream) => break Ok(()),
                Ok(Tick::Frame(_)) => {}
                Err(e) => break Err(e),
            }
        };

        if let Some(state_out) = state_out {
            info!("Saving state to {}", state_out.as_ref().display());
            if let Err(e) = self.state.save(state_out) {
                error!("Error saving state: {e:?}!");
            }
        }
        self.gripper.disconnect();

        result.map(|_| self.summary)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::NamedTempFile;

    use crate::grasp_config::DelayTuning;
    use crate::grasp_controller::GraspPhase;
    use crate::gripper_hal::LinkTiming;
    use crate::gripper_hal_mock::{Fault, SimulatedGripper};
    use crate::gripper_link::ModbusGripper;
    use crate::gripper_registers::{GripperStatus, Register};
    use crate::tactile_hal_mock::{synthetic_sensor, Scenario, Segment};

    use super::*;

    fn tuning() -> GraspTuning {
        GraspTuning { delays: DelayTuning::none(), ..Default::default() }
    }

    fn runner_for(segments: Vec<Segment>) -> (GraspRunner, SimulatedGripper) {
        let tuning = tuning();
        let device = SimulatedGripper::new(1);
        let link = ModbusGripper::new(device.clone(), 1).with_timing(LinkTiming::immediate());
        let scenario = Scenario::new(segments);
        let sensors = (
            synthetic_sensor(Finger::Left, tuning.grid, scenario.clone(), 1),
            synthetic_sensor(Finger::Right, tuning.grid, scenario, 2),
        );
        let mut runner = GraspRunner::new(Box::new(link), sensors, tuning, None);
        runner.calibrate().unwrap();
        (runner, device)
    }

    fn pick_up(contact_frames: u64) -> Vec<Segment> {
        vec![Segment::steady(8, 0.0, 0.0), Segment::steady(contact_frames, 0.2, 0.4)]
    }

    #[test]
    fn test_prepare_gripper() {
        let (mut runner, device) = runner_for(pick_up(5));
        runner.prepare_gripper().unwrap();
        assert_eq!(device.register(Register::ControlMode.address()), 1);
        assert_eq!(device.register(Register::GripCurrent.address()), 1000);
        assert_eq!(device.register(Register::GripSpeed.address()), 2000);
        assert_eq!(device.status(), GripperStatus::ReleaseComplete);
    }

    #[test]
    fn test_grip_then_x_slip_release() {
        let mut segments = pick_up(16);
        segments.push(Segment::steady(6, 1.2, 0.4));
        segments.push(Segment::steady(10, 0.0, 0.0));
        let (runner, device) = runner_for(segments);

        let summary = runner.run(None, None::<&Path>).unwrap();
        assert_eq!(summary.grips, 1);
        assert_eq!(summary.releases, 1);
        assert_eq!(summary.actuation_failures, 0);
        assert_eq!(device.status(), GripperStatus::ReleaseComplete);
    }

    #[test]
    fn test_grip_confirmed_and_held() {
        let (mut runner, device) = runner_for(pick_up(10));
        let mut intents = vec![];
        while let Tick::Frame(intent) = runner.tick().unwrap() {
            intents.push(intent);
        }
        assert!(intents.contains(&Intent::Grip));
        assert!(intents.contains(&Intent::GripConfirmed));
        assert_eq!(runner.state().phase, GraspPhase::Gripping);
        assert!(runner.state().gripping);
        assert_eq!(device.status(), GripperStatus::GrippedObject);
    }

    #[test]
    fn test_failed_grip_not_committed_then_retried() {
        let (mut runner, device) = runner_for(pick_up(10));
        device.inject(Fault::Silent);
        let mut saw_failure = false;
        while let Tick::Frame(intent) = runner.tick().unwrap() {
            if intent == Intent::Grip && !saw_failure {
                saw_failure = true;
                assert!(!runner.state().gripping);
                assert_eq!(runner.state().grip_validation, None);
            }
        }
        assert!(saw_failure);
        assert_eq!(runner.summary().actuation_failures, 1);
        assert_eq!(runner.summary().grips, 1);
        assert_eq!(runner.state().phase, GraspPhase::Gripping);
    }

    #[test]
    fn test_persistent_failures_escalate_and_state_saved() {
        let (runner, device) = runner_for(pick_up(20));
        device.inject_times(Fault::Silent, 5);
        let state_out = NamedTempFile::new().unwrap();

        assert!(runner.run(None, Some(state_out.path())).is_err());
        let saved = GraspState::from_save_state(state_out.path()).unwrap();
        assert_eq!(saved, GraspState::new(1000));
    }

    #[test]
    fn test_sustained_slide_raises_grip_current() {
        let mut segments = pick_up(10);
        for k in 0..12 {
            segments.push(Segment::steady(1, 0.2, -1.2 - 0.2 * k as f64));
        }
        let (mut runner, device) = runner_for(segments);
        runner.prepare_gripper().unwrap();

        let mut intents = vec![];
        while let Tick::Frame(intent) = runner.tick().unwrap() {
            intents.push(intent);
        }
        assert!(intents.contains(&Intent::SlipWarning { count: 5 }));
        assert!(intents.contains(&Intent::RaiseGripCurrent(1050)));
        assert_eq!(device.register(Register::GripCurrent.address()), 1050);
        assert_eq!(runner.state().grip_current, 1050);
        assert_eq!(runner.state().phase, GraspPhase::Gripping);
    }

    #[test]
    fn test_dropped_frames_leave_state_alone() {
        let mut segments = pick_up(2);
        segments.push(Segment::steady(6, 0.2, 0.4).with_lost_markers(63));
        let (mut runner, device) = runner_for(segments);

        let mut intents = vec![];
        while let Tick::Frame(intent) = runner.tick().unwrap() {
            intents.push(intent);
        }
        assert_eq!(intents[intents.len() - 6..], [Intent::Hold; 6]);
        assert!(!intents.contains(&Intent::Grip));
        assert_eq!(runner.state().contact_stable_count, 1);
        assert_eq!(runner.state().phase, GraspPhase::Waiting);
        assert!(!runner.state().gripping);
        assert_eq!(device.requests_seen(), 0);
    }

    #[test]
    fn test_max_frames() {
        let (runner, _device) = runner_for(pick_up(30));
        let summary = runner.run(Some(7), None::<&Path>).unwrap();
        assert_eq!(summary.frames, 7);
    }
}
