//! The grasp state machine as a pure transition function over [`GraspState`].
//!
//! [`GraspController::step`] never touches hardware. It hands back the candidate next state
//! together with an [`Intent`]; the caller performs the intent and only then adopts the new
//! state, so a failed grip or release leaves the old state in place for the next frame.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use log::info;
use serde::{Deserialize, Serialize};

use crate::grasp_config::ControllerTuning;
use crate::grip_error::GripError;
use crate::signal_detectors::Signals;

#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum GraspPhase {
    Waiting,
    Gripping,
}

impl GraspPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            GraspPhase::Waiting => "WAITING",
            GraspPhase::Gripping => "GRIPPING",
        }
    }
}

impl fmt::Display for GraspPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GraspPhase {
    type Err = GripError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WAITING" => Ok(GraspPhase::Waiting),
            "GRIPPING" => Ok(GraspPhase::Gripping),
            other => Err(GripError::InvalidStateTransition(other.to_owned())),
        }
    }
}

impl TryFrom<String> for GraspPhase {
    type Error = GripError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<GraspPhase> for String {
    fn from(phase: GraspPhase) -> Self {
        phase.as_str().to_owned()
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
pub struct GraspState {
    pub phase: GraspPhase,
    /// Whether the last grip command that went through has not been followed by a release.
    pub gripping: bool,
    pub contact_stable_count: u32,
    pub no_contact_stable_count: u32,
    pub slip_recovery_count: u32,
    pub weight_monitor_count: u32,
    /// Frames spent confirming a grip that was just issued, if one is pending.
    pub grip_validation: Option<u32>,
    pub y_slip_warning_count: u32,
    pub twist_warning_count: u32,
    /// Commanded grip current; raised on sustained slip and kept across grips.
    pub grip_current: u16,
}

impl GraspState {
    pub fn new(grip_current: u16) -> Self {
        Self {
            phase: GraspPhase::Waiting,
            gripping: false,
            contact_stable_count: 0,
            no_contact_stable_count: 0,
            slip_recovery_count: 0,
            weight_monitor_count: 0,
            grip_validation: None,
            y_slip_warning_count: 0,
            twist_warning_count: 0,
            grip_current,
        }
    }

    fn reset_counters(&mut self) {
        self.contact_stable_count = 0;
        self.no_contact_stable_count = 0;
        self.slip_recovery_count = 0;
        self.weight_monitor_count = 0;
        self.grip_validation = None;
        self.y_slip_warning_count = 0;
        self.twist_warning_count = 0;
    }

    pub fn from_save_state(state_in: impl AsRef<Path>) -> anyhow::Result<Self> {
        let state_in = state_in.as_ref();
        let file = File::open(state_in)
            .with_context(|| format!("Opening saved state {}", state_in.display()))?;
        let reader = BufReader::new(file);
        let mut state: GraspState = serde_json::from_reader(reader)
            .with_context(|| format!("Parsing saved state {}", state_in.display()))?;
        state.scrub_save_state();
        Ok(state)
    }

    /// Whatever the gripper was doing when the state was saved can't be trusted now, so start
    /// over from WAITING. Only the escalated grip current survives.
    fn scrub_save_state(&mut self) {
        self.phase = GraspPhase::Waiting;
        self.gripping = false;
        self.reset_counters();
    }

    pub fn save(&self, state_out: impl AsRef<Path>) -> anyhow::Result<()> {
        let file = File::create(state_out)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer(writer, self)?;
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ReleaseReason {
    ContactLost,
    GripNotConfirmed,
    SlipX,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum StallCause {
    Twist,
    Disturbance,
}

/// What the caller should do with this frame's transition.
#[derive(Debug, PartialEq, Copy, Clone)]
pub enum Intent {
    Hold,
    /// Close the gripper; the following frames validate the grip.
    Grip,
    /// Validation frame without contact yet; poll again.
    AwaitGripConfirmation { frame: u32 },
    GripConfirmed,
    Release(ReleaseReason),
    RaiseGripCurrent(u16),
    SlipWarning { count: u32 },
    /// Sustained slip, but the grip current is already at its ceiling.
    SlipAtMaxCurrent,
    Stall { cause: StallCause, warn: bool },
    ReportWeight(f64),
}

impl Intent {
    /// Whether this intent sends a command to the gripper.
    pub fn actuates(&self) -> bool {
        matches!(self, Intent::Grip | Intent::Release(_) | Intent::RaiseGripCurrent(_))
    }
}

pub struct GraspController {
    tuning: ControllerTuning,
}

impl GraspController {
    pub fn new(tuning: ControllerTuning) -> Self {
        Self { tuning }
    }

    pub fn tuning(&self) -> &ControllerTuning {
        &self.tuning
    }

    pub fn step(&self, state: GraspState, signals: &Signals) -> (GraspState, Intent) {
        match state.phase {
            GraspPhase::Waiting => match state.grip_validation {
                Some(frame) => self.validate_grip(state, frame, signals),
                None => self.wait_for_contact(state, signals),
            },
            GraspPhase::Gripping => self.hold(state, signals),
        }
    }

    fn validate_grip(&self, mut state: GraspState, frame: u32, signals: &Signals) -> (GraspState, Intent) {
        if signals.contact {
            state.phase = GraspPhase::Gripping;
            state.reset_counters();
            return (state, Intent::GripConfirmed);
        }
        let frame = frame + 1;
        if frame >= self.tuning.validation_frames {
            state.gripping = false;
            state.grip_validation = None;
            state.contact_stable_count = 0;
            state.slip_recovery_count = 0;
            return (state, Intent::Release(ReleaseReason::GripNotConfirmed));
        }
        state.grip_validation = Some(frame);
        (state, Intent::AwaitGripConfirmation { frame })
    }

    fn wait_for_contact(&self, mut state: GraspState, signals: &Signals) -> (GraspState, Intent) {
        let stable = self.tuning.stable_frames;
        let mut intent = Intent::Hold;

        if signals.contact {
            state.contact_stable_count += 1;
            state.no_contact_stable_count = 0;
            if state.contact_stable_count >= stable
                && !state.gripping
                && state.slip_recovery_count >= self.tuning.recovery_frames
            {
                state.gripping = true;
                state.grip_validation = Some(0);
                return (state, Intent::Grip);
            }
        } else {
            state.no_contact_stable_count += 1;
            state.contact_stable_count = 0;
            if state.no_contact_stable_count >= stable && state.gripping {
                state.gripping = false;
                state.no_contact_stable_count = 0;
                intent = Intent::Release(ReleaseReason::ContactLost);
            }
        }

        if state.slip_recovery_count < self.tuning.recovery_frames {
            state.slip_recovery_count += 1;
        }
        (state, intent)
    }

    fn hold(&self, mut state: GraspState, signals: &Signals) -> (GraspState, Intent) {
        if signals.twist {
            state.twist_warning_count = state.twist_warning_count.saturating_add(1);
            let warn = state.twist_warning_count <= self.tuning.twist_warning_cap;
            return (state, Intent::Stall { cause: StallCause::Twist, warn });
        }
        state.twist_warning_count = 0;

        if signals.slip.x {
            state.gripping = false;
            state.phase = GraspPhase::Waiting;
            state.reset_counters();
            return (state, Intent::Release(ReleaseReason::SlipX));
        }

        if signals.slip.y {
            if signals.disturbance {
                state.y_slip_warning_count = 0;
                return (state, Intent::Stall { cause: StallCause::Disturbance, warn: true });
            }
            state.y_slip_warning_count = state.y_slip_warning_count.saturating_add(1);
            let cap = self.tuning.y_slip_warning_cap;
            let intent = match state.y_slip_warning_count {
                count if count <= cap => Intent::SlipWarning { count },
                count if count == cap + 1 => self.escalate(&mut state),
                _ => Intent::Hold,
            };
            return (state, intent);
        }

        state.y_slip_warning_count = 0;
        if signals.disturbance {
            return (state, Intent::Stall { cause: StallCause::Disturbance, warn: true });
        }

        state.weight_monitor_count += 1;
        if state.weight_monitor_count >= self.tuning.weight_interval {
            if let Some(weight) = signals.weight {
                state.weight_monitor_count = 0;
                return (state, Intent::ReportWeight(weight));
            }
        }
        (state, Intent::Hold)
    }

    fn escalate(&self, state: &mut GraspState) -> Intent {
        let ceiling = self.tuning.max_grip_current;
        if state.grip_current >= ceiling {
            return Intent::SlipAtMaxCurrent;
        }
        let raised = state.grip_current.saturating_add(self.tuning.force_increment).min(ceiling);
        state.grip_current = raised;
        Intent::RaiseGripCurrent(raised)
    }
}

/// The operator-facing banner printed whenever the phase changes.
pub fn log_phase_change(from: GraspPhase, to: GraspPhase) {
    if from != to {
        info!("=====");
        info!("current state: {to}");
        info!("=====");
    }
}

#[cfg(test)]
mod tests {
    use tempfile::NamedTempFile;

    use crate::signal_detectors::Slip;

    use super::*;

    fn controller() -> GraspController {
        GraspController::new(ControllerTuning::default())
    }

    fn contact() -> Signals {
        Signals { contact: true, ..Default::default() }
    }

    fn nothing() -> Signals {
        Signals::default()
    }

    fn saturated() -> GraspState {
        GraspState { slip_recovery_count: 5, ..GraspState::new(1000) }
    }

    fn gripping() -> GraspState {
        GraspState { phase: GraspPhase::Gripping, gripping: true, ..GraspState::new(1000) }
    }

    fn quiet_hold(weight: f64) -> Signals {
        Signals { contact: true, weight: Some(weight), ..Default::default() }
    }

    #[test]
    fn test_three_contacts_then_grip_then_confirm() {
        let c = controller();
        let mut state = saturated();
        let mut intents = vec![];
        for _ in 0..3 {
            let (next, intent) = c.step(state, &contact());
            state = next;
            intents.push(intent);
        }
        assert_eq!(intents, vec![Intent::Hold, Intent::Hold, Intent::Grip]);
        assert!(state.gripping);
        assert_eq!(state.grip_validation, Some(0));
        assert_eq!(state.phase, GraspPhase::Waiting);

        let (state, intent) = c.step(state, &contact());
        assert_eq!(intent, Intent::GripConfirmed);
        assert_eq!(state.phase, GraspPhase::Gripping);
        assert_eq!(state, GraspState { phase: GraspPhase::Gripping, gripping: true, ..GraspState::new(1000) });
    }

    #[test]
    fn test_confirmation_within_validation_window() {
        let c = controller();
        let (mut state, intent) = c.step(GraspState { contact_stable_count: 2, ..saturated() }, &contact());
        assert_eq!(intent, Intent::Grip);
        for frame in 1..=13 {
            let (next, intent) = c.step(state, &nothing());
            assert_eq!(intent, Intent::AwaitGripConfirmation { frame });
            state = next;
        }
        let (state, intent) = c.step(state, &contact());
        assert_eq!(intent, Intent::GripConfirmed);
        assert_eq!(state.phase, GraspPhase::Gripping);
        assert_eq!(state.contact_stable_count, 0);
        assert_eq!(state.slip_recovery_count, 0);
        assert_eq!(state.grip_validation, None);
    }

    #[test]
    fn test_unconfirmed_grip_releases() {
        let c = controller();
        let mut state = GraspState { gripping: true, grip_validation: Some(0), ..saturated() };
        let mut last = Intent::Hold;
        for _ in 0..15 {
            let (next, intent) = c.step(state, &nothing());
            state = next;
            last = intent;
        }
        assert_eq!(last, Intent::Release(ReleaseReason::GripNotConfirmed));
        assert_eq!(state.phase, GraspPhase::Waiting);
        assert!(!state.gripping);
        assert_eq!(state.grip_validation, None);
        assert_eq!(state.contact_stable_count, 0);
        assert_eq!(state.slip_recovery_count, 0);
    }

    #[test]
    fn test_no_grip_before_recovery() {
        let c = controller();
        let mut state = GraspState::new(1000);
        let mut intents = vec![];
        for _ in 0..6 {
            let (next, intent) = c.step(state, &contact());
            state = next;
            intents.push(intent);
        }
        // Recovery reaches 5 after the fifth frame; the sixth may grip.
        assert_eq!(intents[..5], [Intent::Hold; 5]);
        assert_eq!(intents[5], Intent::Grip);
    }

    #[test]
    fn test_recovery_saturates() {
        let c = controller();
        let mut state = GraspState::new(1000);
        for _ in 0..20 {
            state = c.step(state, &nothing()).0;
        }
        assert_eq!(state.slip_recovery_count, 5);
    }

    #[test]
    fn test_contact_lost_while_holding_releases() {
        let c = controller();
        let mut state = GraspState { gripping: true, ..saturated() };
        let mut intents = vec![];
        for _ in 0..3 {
            let (next, intent) = c.step(state, &nothing());
            state = next;
            intents.push(intent);
        }
        assert_eq!(intents, vec![Intent::Hold, Intent::Hold, Intent::Release(ReleaseReason::ContactLost)]);
        assert!(!state.gripping);
        assert_eq!(state.no_contact_stable_count, 0);
    }

    #[test]
    fn test_x_slip_releases_immediately() {
        let c = controller();
        let state = GraspState { weight_monitor_count: 12, y_slip_warning_count: 3, ..gripping() };
        let signals = Signals { contact: true, slip: Slip { x: true, y: true }, ..Default::default() };
        let (state, intent) = c.step(state, &signals);
        assert_eq!(intent, Intent::Release(ReleaseReason::SlipX));
        assert_eq!(state.phase, GraspPhase::Waiting);
        assert!(!state.gripping);
        assert_eq!(state.weight_monitor_count, 0);
        assert_eq!(state.y_slip_warning_count, 0);
        assert_eq!(state.slip_recovery_count, 0);
    }

    #[test]
    fn test_twist_stalls_ahead_of_slip() {
        let c = controller();
        let signals = Signals { twist: true, slip: Slip { x: true, y: false }, ..Default::default() };
        let mut state = gripping();
        let mut warnings = vec![];
        for _ in 0..7 {
            let (next, intent) = c.step(state, &signals);
            match intent {
                Intent::Stall { cause: StallCause::Twist, warn } => warnings.push(warn),
                other => panic!("unexpected {other:?}"),
            }
            state = next;
        }
        assert_eq!(warnings, vec![true, true, true, true, true, false, false]);
        assert_eq!(state.phase, GraspPhase::Gripping);

        let (state, _) = c.step(state, &quiet_hold(1.0));
        assert_eq!(state.twist_warning_count, 0);
    }

    #[test]
    fn test_y_slip_warns_then_escalates_once() {
        let c = controller();
        let signals = Signals { contact: true, slip: Slip { x: false, y: true }, ..Default::default() };
        let mut state = gripping();
        let mut intents = vec![];
        for _ in 0..8 {
            let (next, intent) = c.step(state, &signals);
            state = next;
            intents.push(intent);
        }
        assert_eq!(intents[0], Intent::SlipWarning { count: 1 });
        assert_eq!(intents[4], Intent::SlipWarning { count: 5 });
        assert_eq!(intents[5], Intent::RaiseGripCurrent(1050));
        assert_eq!(intents[6..], [Intent::Hold, Intent::Hold]);
        assert_eq!(state.grip_current, 1050);
        assert_eq!(state.phase, GraspPhase::Gripping);
    }

    #[test]
    fn test_escalation_clamped_at_max() {
        let c = controller();
        let signals = Signals { slip: Slip { x: false, y: true }, ..Default::default() };

        let near = GraspState { y_slip_warning_count: 5, grip_current: 1980, ..gripping() };
        let (state, intent) = c.step(near, &signals);
        assert_eq!(intent, Intent::RaiseGripCurrent(2000));
        assert_eq!(state.grip_current, 2000);

        let at_max = GraspState { y_slip_warning_count: 5, grip_current: 2000, ..gripping() };
        let (state, intent) = c.step(at_max, &signals);
        assert_eq!(intent, Intent::SlipAtMaxCurrent);
        assert_eq!(state.grip_current, 2000);
        assert!(!intent.actuates());
    }

    #[test]
    fn test_y_slip_during_disturbance_is_suppressed() {
        let c = controller();
        let signals = Signals { slip: Slip { x: false, y: true }, disturbance: true, ..Default::default() };
        let state = GraspState { y_slip_warning_count: 4, ..gripping() };
        let (state, intent) = c.step(state, &signals);
        assert_eq!(intent, Intent::Stall { cause: StallCause::Disturbance, warn: true });
        assert_eq!(state.y_slip_warning_count, 0);
        assert_eq!(state.grip_current, 1000);
    }

    #[test]
    fn test_weight_reported_every_interval() {
        let c = controller();
        let mut state = gripping();
        let mut reports = vec![];
        for _ in 0..60 {
            let (next, intent) = c.step(state, &quiet_hold(2.5));
            if let Intent::ReportWeight(w) = intent {
                reports.push(w);
            }
            state = next;
        }
        assert_eq!(reports, vec![2.5, 2.5]);
        assert_eq!(state.weight_monitor_count, 0);
    }

    #[test]
    fn test_disturbance_pauses_weight_monitor() {
        let c = controller();
        let state = GraspState { weight_monitor_count: 29, ..gripping() };
        let signals = Signals { disturbance: true, weight: Some(1.0), ..Default::default() };
        let (state, intent) = c.step(state, &signals);
        assert_eq!(intent, Intent::Stall { cause: StallCause::Disturbance, warn: true });
        assert_eq!(state.weight_monitor_count, 29);
    }

    #[test]
    fn test_phase_names() {
        assert_eq!("GRIPPING".parse::<GraspPhase>(), Ok(GraspPhase::Gripping));
        assert_eq!(GraspPhase::Waiting.to_string(), "WAITING");
        assert_eq!(
            "HOVERING".parse::<GraspPhase>(),
            Err(GripError::InvalidStateTransition("HOVERING".to_owned())));
    }

    #[test]
    fn test_save_state_scrubbed_on_load() {
        let file = NamedTempFile::new().unwrap();
        let state = GraspState { weight_monitor_count: 7, y_slip_warning_count: 6, grip_current: 1150, ..gripping() };
        state.save(file.path()).unwrap();

        let loaded = GraspState::from_save_state(file.path()).unwrap();
        assert_eq!(loaded, GraspState::new(1150));
    }

    #[test]
    fn test_unknown_phase_in_save_state() {
        let file = NamedTempFile::new().unwrap();
        let mut json = serde_json::to_value(GraspState::new(1000)).unwrap();
        json["phase"] = "HOVERING".into();
        serde_json::to_writer(file.as_file(), &json).unwrap();

        let err = GraspState::from_save_state(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("HOVERING"));
    }
}
