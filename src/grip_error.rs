use std::io;

use thiserror::Error;

#[derive(Error, PartialEq, Clone, Debug)]
pub enum GripError {
    #[error("insufficient history: need {needed} samples, have {available}")]
    InsufficientHistory { needed: usize, available: usize },

    #[error("tracking unavailable: {tracked} of {required} markers validated")]
    TrackingUnavailable { tracked: usize, required: usize },

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("device exception {code:#04x} for function {function:#04x}")]
    ModbusException { function: u8, code: u8 },

    #[error("{what} out of range: {value} not in {min}..={max}")]
    OutOfRange { what: &'static str, value: i64, min: i64, max: i64 },

    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("tracking channel used before calibration")]
    NotCalibrated,

    #[error("calibration requires at least one marker")]
    EmptyCalibration,

    #[error("actuator session is not connected")]
    NotConnected,
}

impl GripError {
    /// Errors the per-frame pipeline absorbs locally without touching controller state.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GripError::InsufficientHistory { .. } | GripError::TrackingUnavailable { .. }
        )
    }

    pub fn out_of_range(what: &'static str, value: impl Into<i64>, range: (i64, i64)) -> Self {
        GripError::OutOfRange { what, value: value.into(), min: range.0, max: range.1 }
    }
}

impl From<io::Error> for GripError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut => GripError::TransportFailure(String::from("read timed out")),
            io::ErrorKind::UnexpectedEof => GripError::TransportFailure(String::from("short response")),
            _ => GripError::TransportFailure(e.to_string()),
        }
    }
}

pub type GripResult<T> = Result<T, GripError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_timeout_maps_to_transport_failure() {
        let err = GripError::from(io::Error::new(io::ErrorKind::TimedOut, "operation timed out"));
        assert_eq!(err, GripError::TransportFailure(String::from("read timed out")));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_recoverable_kinds() {
        assert!(GripError::InsufficientHistory { needed: 5, available: 1 }.is_recoverable());
        assert!(GripError::TrackingUnavailable { tracked: 60, required: 63 }.is_recoverable());
        assert!(!GripError::out_of_range("grip current", 2100, (500, 2000)).is_recoverable());
        assert!(!GripError::InvalidStateTransition(String::from("HOLDING")).is_recoverable());
    }
}
