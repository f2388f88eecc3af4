//! Register map of the two-finger electric gripper.

use std::fmt;

use crate::grip_error::{GripError, GripResult};

pub const GRIP_CURRENT_RANGE: (u16, u16) = (500, 2000);
pub const GRIP_SPEED_RANGE: (u32, u32) = (10, 3000);
pub const COMM_ADDRESS_RANGE: (u8, u8) = (1, 247);

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub enum Register {
    CommAddress,
    SaveComm,
    ControlMode,
    ReleaseCommand,
    GripCommand,
    ReleasePosition,
    GripPosition,
    Status,
    CurrentRead,
    SpeedRead,
    GripCurrent,
    GripSpeed,
    SaveConfig,
    AutoFindOnPower,
    ResetFindTravel,
}

impl Register {
    pub const ALL: [Register; 15] = [
        Register::CommAddress,
        Register::SaveComm,
        Register::ControlMode,
        Register::ReleaseCommand,
        Register::GripCommand,
        Register::ReleasePosition,
        Register::GripPosition,
        Register::Status,
        Register::CurrentRead,
        Register::SpeedRead,
        Register::GripCurrent,
        Register::GripSpeed,
        Register::SaveConfig,
        Register::AutoFindOnPower,
        Register::ResetFindTravel,
    ];

    pub fn address(&self) -> u16 {
        match self {
            Register::CommAddress => 0x001F,
            Register::SaveComm => 0x0019,
            Register::ControlMode => 0x0035,
            Register::ReleaseCommand => 0x0036,
            Register::GripCommand => 0x0037,
            Register::ReleasePosition => 0x0038,
            Register::GripPosition => 0x003A,
            Register::Status => 0x0040,
            Register::CurrentRead => 0x0041,
            Register::SpeedRead => 0x0042,
            Register::GripCurrent => 0x0044,
            Register::GripSpeed => 0x0045,
            Register::SaveConfig => 0x0047,
            Register::AutoFindOnPower => 0x0051,
            Register::ResetFindTravel => 0x0052,
        }
    }

    /// Number of consecutive 16-bit registers the value spans (low word first).
    pub fn width(&self) -> u16 {
        match self {
            Register::ReleasePosition | Register::GripPosition | Register::SpeedRead | Register::GripSpeed => 2,
            _ => 1,
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, Register::Status | Register::CurrentRead | Register::SpeedRead)
    }

    pub fn from_address(address: u16) -> Option<Register> {
        Register::ALL.iter().copied().find(|r| r.address() == address)
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}@{:#06x}", self.address())
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum GripperStatus {
    Idle,
    GrippedObject,
    GrippedNothing,
    GripStarting,
    ReleaseStarting,
    ReleaseComplete,
    Unknown(u16),
}

impl GripperStatus {
    pub fn code(&self) -> u16 {
        match *self {
            GripperStatus::Idle => 0,
            GripperStatus::GrippedObject => 1,
            GripperStatus::GrippedNothing => 2,
            GripperStatus::GripStarting => 4,
            GripperStatus::ReleaseStarting => 5,
            GripperStatus::ReleaseComplete => 6,
            GripperStatus::Unknown(code) => code,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            GripperStatus::Idle => "idle",
            GripperStatus::GrippedObject => "gripped, object detected",
            GripperStatus::GrippedNothing => "gripped, no object",
            GripperStatus::GripStarting => "grip starting",
            GripperStatus::ReleaseStarting => "release starting",
            GripperStatus::ReleaseComplete => "release complete",
            GripperStatus::Unknown(_) => "unknown status",
        }
    }
}

impl From<u16> for GripperStatus {
    fn from(code: u16) -> Self {
        match code {
            0 => GripperStatus::Idle,
            1 => GripperStatus::GrippedObject,
            2 => GripperStatus::GrippedNothing,
            4 => GripperStatus::GripStarting,
            5 => GripperStatus::ReleaseStarting,
            6 => GripperStatus::ReleaseComplete,
            other => GripperStatus::Unknown(other),
        }
    }
}

impl fmt::Display for GripperStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code(), self.description())
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ControlMode {
    Io,
    Serial,
}

impl ControlMode {
    pub fn code(&self) -> u16 {
        match self {
            ControlMode::Io => 0,
            ControlMode::Serial => 1,
        }
    }
}

impl TryFrom<u16> for ControlMode {
    type Error = GripError;

    fn try_from(code: u16) -> GripResult<Self> {
        match code {
            0 => Ok(ControlMode::Io),
            1 => Ok(ControlMode::Serial),
            other => Err(GripError::out_of_range("control mode", other, (0, 1))),
        }
    }
}

pub fn check_grip_current(current: u16) -> GripResult<u16> {
    let (min, max) = GRIP_CURRENT_RANGE;
    if !(min..=max).contains(&current) {
        return Err(GripError::out_of_range("grip current", current, (min.into(), max.into())));
    }
    Ok(current)
}

pub fn check_grip_speed(speed: u32) -> GripResult<u32> {
    let (min, max) = GRIP_SPEED_RANGE;
    if !(min..=max).contains(&speed) {
        return Err(GripError::out_of_range("grip speed", speed, (min.into(), max.into())));
    }
    Ok(speed)
}

pub fn check_comm_address(address: u8) -> GripResult<u8> {
    let (min, max) = COMM_ADDRESS_RANGE;
    if !(min..=max).contains(&address) {
        return Err(GripError::out_of_range("comm address", address, (min.into(), max.into())));
    }
    Ok(address)
}
