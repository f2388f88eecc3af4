use std::path::PathBuf;

use log::info;

use crate::displacement::GridShape;
use crate::tactile_hal::{Finger, TactileSensor};
use crate::tactile_hal_mock::{synthetic_sensor, Scenario};
use crate::tactile_hal_replay::{replay_sensor, Recording};

/// Recorded tracks for both fingers.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayFiles {
    pub left: PathBuf,
    pub right: PathBuf,
}

pub struct TactileHalFactory {
    grid: GridShape,
    replay: Option<ReplayFiles>,
    seed: u64,
}

impl TactileHalFactory {
    pub fn new(grid: GridShape, replay: Option<ReplayFiles>, seed: u64) -> Self {
        Self { grid, replay, seed }
    }

    /// Left sensor first, then right; the pipeline always advances them in that order.
    pub fn create_sensors(&self) -> anyhow::Result<(TactileSensor, TactileSensor)> {
        match &self.replay {
            Some(files) => {
                info!("Replaying {} / {}", files.left.display(), files.right.display());
                Ok((
                    replay_sensor(Finger::Left, Recording::load(&files.left)?),
                    replay_sensor(Finger::Right, Recording::load(&files.right)?),
                ))
            }
            None => {
                info!("Using synthetic sensors (seed {})", self.seed);
                Ok((
                    synthetic_sensor(Finger::Left, self.grid, Scenario::water_bottle(Finger::Left), self.seed),
                    synthetic_sensor(Finger::Right, self.grid, Scenario::water_bottle(Finger::Right), self.seed.wrapping_add(1)),
                ))
            }
        }
    }
}
