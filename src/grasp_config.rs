use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::displacement::GridShape;
use crate::feature_history::DEFAULT_HISTORY_CAPACITY;
use crate::gripper_registers::{GRIP_CURRENT_RANGE, GRIP_SPEED_RANGE};
use crate::signal_detectors::DetectorTuning;

/// Hysteresis constants for the grasp state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerTuning {
    /// Consecutive frames of contact (or of no contact) before acting on it.
    pub stable_frames: u32,
    /// Frames spent waiting after a release before another grip is allowed.
    pub recovery_frames: u32,
    /// Frames to wait for contact to confirm a fresh grip.
    pub validation_frames: u32,
    /// Quiet gripping frames between weight reports.
    pub weight_interval: u32,
    pub y_slip_warning_cap: u32,
    pub twist_warning_cap: u32,
    pub force_increment: u16,
    pub max_grip_current: u16,
}

impl Default for ControllerTuning {
    fn default() -> Self {
        Self {
            stable_frames: 3,
            recovery_frames: 5,
            validation_frames: 15,
            weight_interval: 30,
            y_slip_warning_cap: 5,
            twist_warning_cap: 5,
            force_increment: 50,
            max_grip_current: GRIP_CURRENT_RANGE.1,
        }
    }
}

/// Pauses the loop inserts around actuation, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayTuning {
    pub grip_settle_ms: u64,
    pub failed_grip_release_ms: u64,
    pub slip_recovery_ms: u64,
    pub validation_poll_ms: u64,
}

impl Default for DelayTuning {
    fn default() -> Self {
        Self {
            grip_settle_ms: 1000,
            failed_grip_release_ms: 500,
            slip_recovery_ms: 2000,
            validation_poll_ms: 100,
        }
    }
}

impl DelayTuning {
    pub fn grip_settle(&self) -> Duration {
        Duration::from_millis(self.grip_settle_ms)
    }

    pub fn failed_grip_release(&self) -> Duration {
        Duration::from_millis(self.failed_grip_release_ms)
    }

    pub fn slip_recovery(&self) -> Duration {
        Duration::from_millis(self.slip_recovery_ms)
    }

    pub fn validation_poll(&self) -> Duration {
        Duration::from_millis(self.validation_poll_ms)
    }

    /// Everything zeroed, for simulated runs and tests.
    pub fn none() -> Self {
        Self { grip_settle_ms: 0, failed_grip_release_ms: 0, slip_recovery_ms: 0, validation_poll_ms: 0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraspTuning {
    pub history_capacity: usize,
    pub grid: GridShape,
    pub detectors: DetectorTuning,
    pub controller: ControllerTuning,
    pub delays: DelayTuning,
    pub initial_grip_current: u16,
    pub grip_speed: u32,
    pub warmup_frames: u32,
    pub report_interval: u64,
    pub max_consecutive_failures: u32,
}

impl Default for GraspTuning {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            grid: GridShape::GELSIGHT_MINI,
            detectors: DetectorTuning::default(),
            controller: ControllerTuning::default(),
            delays: DelayTuning::default(),
            initial_grip_current: 1000,
            grip_speed: 2000,
            warmup_frames: 3,
            report_interval: 90,
            max_consecutive_failures: 5,
        }
    }
}

impl GraspTuning {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Opening tuning file {}", path.display()))?;
        let tuning: GraspTuning = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Parsing tuning file {}", path.display()))?;
        tuning.validate()?;
        Ok(tuning)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// Rejects values the gripper would refuse anyway.
    pub fn validate(&self) -> anyhow::Result<()> {
        let (min_current, max_current) = GRIP_CURRENT_RANGE;
        if !(min_current..=max_current).contains(&self.initial_grip_current) {
            anyhow::bail!("initial_grip_current {} outside {min_current}..={max_current}", self.initial_grip_current);
        }
        if !(min_current..=max_current).contains(&self.controller.max_grip_current) {
            anyhow::bail!("max_grip_current {} outside {min_current}..={max_current}", self.controller.max_grip_current);
        }
        let (min_speed, max_speed) = GRIP_SPEED_RANGE;
        if !(min_speed..=max_speed).contains(&self.grip_speed) {
            anyhow::bail!("grip_speed {} outside {min_speed}..={max_speed}", self.grip_speed);
        }
        if self.detectors.contact_window == 0 {
            anyhow::bail!("contact_window must be at least 1");
        }
        if self.detectors.slip_window == 0 {
            anyhow::bail!("slip_window must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{ "controller": {{ "stable_frames": 4 }}, "grip_speed": 500 }}"#).unwrap();

        let tuning = GraspTuning::load(file.path()).unwrap();
        assert_eq!(tuning.controller.stable_frames, 4);
        assert_eq!(tuning.controller.validation_frames, 15);
        assert_eq!(tuning.grip_speed, 500);
        assert_eq!(tuning.detectors, DetectorTuning::default());
        assert_eq!(tuning.history_capacity, 30);
    }

    #[test]
    fn test_save_then_load() {
        let file = NamedTempFile::new().unwrap();
        let mut tuning = GraspTuning::default();
        tuning.initial_grip_current = 1200;
        tuning.delays = DelayTuning::none();
        tuning.save(file.path()).unwrap();
        assert_eq!(GraspTuning::load(file.path()).unwrap(), tuning);
    }

    #[test]
    fn test_out_of_range_current_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{ "initial_grip_current": 2500 }}"#).unwrap();
        assert!(GraspTuning::load(file.path()).is_err());
    }

    #[test]
    fn test_empty_windows_rejected() {
        for field in ["slip_window", "contact_window"] {
            let mut file = NamedTempFile::new().unwrap();
            write!(file, r#"{{ "detectors": {{ "{field}": 0 }} }}"#).unwrap();
            assert!(GraspTuning::load(file.path()).is_err(), "{field}");
        }
    }
}
