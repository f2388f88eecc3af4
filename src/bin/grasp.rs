//! Closed-loop grasp controller: watches both tactile pads and drives the gripper.
//!
//! With `--fake-hw` the gripper is simulated and, unless recordings are given, the pads play a
//! scripted water-bottle demo.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::info;

use tactile_grip::grasp_config::GraspTuning;
use tactile_grip::grasp_controller::GraspState;
use tactile_grip::grasp_runner::GraspRunner;
use tactile_grip::gripper_hal_factory::{GripperHalFactory, SerialSettings};
use tactile_grip::tactile_hal_factory::{ReplayFiles, TactileHalFactory};

#[derive(Parser, Debug)]
#[clap(name = "grasp")]
struct Opts {
    #[clap(short, long, default_value = "/dev/ttyUSB0")]
    port: String,

    #[clap(long, default_value = "115200")]
    baud_rate: u32,

    #[clap(long, default_value = "1")]
    slave_id: u8,

    /// Serial read timeout in milliseconds.
    #[clap(long, default_value = "1000")]
    timeout_ms: u64,

    #[clap(long)]
    fake_hw: bool,

    /// JSON tuning file; missing keys keep their defaults.
    #[clap(long)]
    config: Option<PathBuf>,

    /// Recorded marker tracks to replay instead of the synthetic sensors.
    #[clap(long)]
    replay_left: Option<PathBuf>,

    #[clap(long)]
    replay_right: Option<PathBuf>,

    #[clap(long, default_value = "1")]
    seed: u64,

    #[clap(long)]
    state_in: Option<PathBuf>,

    #[clap(long)]
    state_out: Option<PathBuf>,

    #[clap(long)]
    max_frames: Option<u64>,

    /// Write the effective tuning to this path and exit.
    #[clap(long)]
    dump_config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opts: Opts = Opts::parse();

    let mut tuning = match &opts.config {
        Some(path) => GraspTuning::load(path)?,
        None => GraspTuning::default(),
    };
    if let Some(path) = &opts.dump_config {
        tuning.save(path)?;
        println!("Wrote {}", path.display());
        return Ok(());
    }
    if opts.fake_hw && opts.config.is_none() {
        tuning.delays.grip_settle_ms = 0;
        tuning.delays.failed_grip_release_ms = 0;
        tuning.delays.slip_recovery_ms = 0;
    }

    let state = match &opts.state_in {
        Some(path) => {
            let state = GraspState::from_save_state(path)?;
            info!("Resuming with grip current {}", state.grip_current);
            Some(state)
        }
        None => None,
    };

    let settings = SerialSettings {
        port: opts.port.clone(),
        baud_rate: opts.baud_rate,
        slave_id: opts.slave_id,
        timeout: Duration::from_millis(opts.timeout_ms),
    };
    let gripper = GripperHalFactory::new_maybe_mock(opts.fake_hw, settings).create_hal()?;

    let replay = match (opts.replay_left, opts.replay_right) {
        (Some(left), Some(right)) => Some(ReplayFiles { left, right }),
        (None, None) => None,
        _ => anyhow::bail!("--replay-left and --replay-right go together"),
    };
    let sensors = TactileHalFactory::new(tuning.grid, replay, opts.seed).create_sensors()?;

    let mut runner = GraspRunner::new(gripper, sensors, tuning, state);
    runner.prepare_gripper()?;
    runner.calibrate()?;
    let summary = runner.run(opts.max_frames, opts.state_out)?;

    println!("{} frames, {} grips, {} releases, {} weight reports (last {:?}), {} gripper failures",
        summary.frames, summary.grips, summary.releases, summary.weight_reports, summary.last_weight,
        summary.actuation_failures);
    Ok(())
}
