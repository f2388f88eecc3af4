use std::io::{Read, Write};
use std::time::Duration;

use crate::grip_error::{GripError, GripResult};
use crate::gripper_registers::{ControlMode, GripperStatus};

pub trait GripperHal {
    fn test_connection(&mut self) -> GripResult<GripperStatus>;
    fn set_control_mode(&mut self, mode: ControlMode) -> GripResult<()>;
    fn grip(&mut self) -> GripResult<()>;
    fn release(&mut self) -> GripResult<()>;
    fn set_grip_current(&mut self, current: u16) -> GripResult<()>;
    fn set_grip_speed(&mut self, speed: u32) -> GripResult<()>;
    fn set_grip_position(&mut self, position: u32) -> GripResult<()>;
    fn set_release_position(&mut self, position: u32) -> GripResult<()>;
    fn status(&mut self) -> GripResult<GripperStatus>;
    fn current(&mut self) -> GripResult<u16>;
    fn speed(&mut self) -> GripResult<u32>;
    fn set_auto_find_on_power(&mut self, enabled: bool) -> GripResult<()>;
    fn reset_find_travel(&mut self) -> GripResult<()>;
    fn set_comm_address(&mut self, address: u8) -> GripResult<()>;
    fn save_config(&mut self) -> GripResult<SaveOutcome>;
    fn disconnect(&mut self);
}

/// Result of asking the gripper to persist its configuration.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum SaveOutcome {
    Confirmed,
    /// The save flag never cleared within the poll budget.
    Unconfirmed,
}

/// Byte pipe to the gripper. Exactly one request is in flight at a time.
pub trait Transport: Read + Write {
    /// Discards stale bytes left over from an earlier, abandoned exchange.
    fn clear_input(&mut self) -> GripResult<()>;
}

impl Transport for Box<dyn serialport::SerialPort> {
    fn clear_input(&mut self) -> GripResult<()> {
        self.clear(serialport::ClearBuffer::Input)
            .map_err(|e| GripError::TransportFailure(e.to_string()))
    }
}

/// Pauses the link inserts between writes and while polling.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkTiming {
    pub inter_write: Duration,
    pub save_poll_interval: Duration,
    pub save_poll_attempts: u32,
}

impl Default for LinkTiming {
    fn default() -> Self {
        Self {
            inter_write: Duration::from_millis(10),
            save_poll_interval: Duration::from_millis(100),
            save_poll_attempts: 10,
        }
    }
}

impl LinkTiming {
    pub fn immediate() -> Self {
        Self { inter_write: Duration::ZERO, save_poll_interval: Duration::ZERO, ..Default::default() }
    }
}
