//! One-shot gripper commands, for bring-up and poking at the device by hand.

use std::time::Duration;

use clap::{Parser, Subcommand};

use tactile_grip::gripper_hal::{GripperHal, SaveOutcome};
use tactile_grip::gripper_hal_factory::{GripperHalFactory, SerialSettings};
use tactile_grip::gripper_registers::ControlMode;

#[derive(Parser, Debug)]
#[clap(name = "gripper_ctl")]
struct Opts {
    #[clap(short, long, default_value = "/dev/ttyUSB0")]
    port: String,

    #[clap(long, default_value = "115200")]
    baud_rate: u32,

    #[clap(long, default_value = "1")]
    slave_id: u8,

    #[clap(long, default_value = "1000")]
    timeout_ms: u64,

    #[clap(long)]
    fake_hw: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Grip,
    Release,
    Status,
    /// Read the torque current being drawn.
    Current,
    Speed,
    /// Set the grip current and persist it.
    SetCurrent { current: u16 },
    /// Set the grip speed and persist it.
    SetSpeed { speed: u32 },
    SetGripPosition { position: u32 },
    SetReleasePosition { position: u32 },
    /// 0 for IO control, 1 for serial control.
    SetMode { mode: u16 },
    AutoFind {
        #[clap(long)]
        off: bool,
    },
    ResetTravel,
    SetAddress { address: u8 },
    Save,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opts: Opts = Opts::parse();

    let settings = SerialSettings {
        port: opts.port,
        baud_rate: opts.baud_rate,
        slave_id: opts.slave_id,
        timeout: Duration::from_millis(opts.timeout_ms),
    };
    let mut hal = GripperHalFactory::new_maybe_mock(opts.fake_hw, settings).create_hal()?;

    execute(hal.as_mut(), opts.command)?;
    hal.disconnect();
    Ok(())
}

fn execute(hal: &mut dyn GripperHal, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Grip => hal.grip()?,
        Command::Release => hal.release()?,
        Command::Status => println!("status: {}", hal.status()?),
        Command::Current => println!("current: {}", hal.current()?),
        Command::Speed => println!("speed: {}", hal.speed()?),
        Command::SetCurrent { current } => {
            hal.set_grip_current(current)?;
            report_save(hal.save_config()?);
        }
        Command::SetSpeed { speed } => {
            hal.set_grip_speed(speed)?;
            report_save(hal.save_config()?);
        }
        Command::SetGripPosition { position } => hal.set_grip_position(position)?,
        Command::SetReleasePosition { position } => hal.set_release_position(position)?,
        Command::SetMode { mode } => hal.set_control_mode(ControlMode::try_from(mode)?)?,
        Command::AutoFind { off } => hal.set_auto_find_on_power(!off)?,
        Command::ResetTravel => hal.reset_find_travel()?,
        Command::SetAddress { address } => hal.set_comm_address(address)?,
        Command::Save => report_save(hal.save_config()?),
    }
    Ok(())
}

fn report_save(outcome: SaveOutcome) {
    match outcome {
        SaveOutcome::Confirmed => println!("saved"),
        SaveOutcome::Unconfirmed => println!("save not confirmed"),
    }
}
