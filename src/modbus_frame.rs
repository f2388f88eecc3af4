//! Modbus RTU framing for the two function codes the gripper speaks.
//!
//! Frames are `[slave][function][payload..][crc_lo][crc_hi]`.

use std::io::Read;

use crc_any::CRCu16;
use log::debug;

use crate::grip_error::{GripError, GripResult};

pub const READ_HOLDING: u8 = 0x03;
pub const WRITE_SINGLE: u8 = 0x06;
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Holding registers a single read may return.
pub const MAX_READ_COUNT: u16 = 125;

pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = CRCu16::crc16modbus();
    crc.digest(data);
    crc.get_crc()
}

pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Returns the frame without its trailing CRC, or a transport failure if the CRC is wrong.
pub fn strip_crc(frame: &[u8]) -> GripResult<&[u8]> {
    if frame.len() < 4 {
        return Err(GripError::TransportFailure(format!("frame too short: {} bytes", frame.len())));
    }
    let (body, crc) = frame.split_at(frame.len() - 2);
    let expected = crc16(body);
    let actual = u16::from_le_bytes([crc[0], crc[1]]);
    if expected != actual {
        return Err(GripError::TransportFailure(format!(
            "crc mismatch: expected {expected:#06x}, got {actual:#06x}")));
    }
    Ok(body)
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Request {
    ReadHolding { slave: u8, start: u16, count: u16 },
    WriteSingle { slave: u8, address: u16, value: u16 },
}

impl Request {
    pub fn slave(&self) -> u8 {
        match *self {
            Request::ReadHolding { slave, .. } | Request::WriteSingle { slave, .. } => slave,
        }
    }

    pub fn function(&self) -> u8 {
        match self {
            Request::ReadHolding { .. } => READ_HOLDING,
            Request::WriteSingle { .. } => WRITE_SINGLE,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let (slave, a, b) = match *self {
            Request::ReadHolding { slave, start, count } => (slave, start, count),
            Request::WriteSingle { slave, address, value } => (slave, address, value),
        };
        let mut frame = Vec::with_capacity(8);
        frame.push(slave);
        frame.push(self.function());
        frame.extend_from_slice(&a.to_be_bytes());
        frame.extend_from_slice(&b.to_be_bytes());
        append_crc(&mut frame);
        frame
    }

    pub fn decode(frame: &[u8]) -> GripResult<Request> {
        let body = strip_crc(frame)?;
        if body.len() != 6 {
            return Err(GripError::TransportFailure(format!("request body of {} bytes", body.len())));
        }
        let a = u16::from_be_bytes([body[2], body[3]]);
        let b = u16::from_be_bytes([body[4], body[5]]);
        match body[1] {
            READ_HOLDING => Ok(Request::ReadHolding { slave: body[0], start: a, count: b }),
            WRITE_SINGLE => Ok(Request::WriteSingle { slave: body[0], address: a, value: b }),
            other => Err(GripError::TransportFailure(format!("unsupported function {other:#04x}"))),
        }
    }
}

pub fn encode_read_response(slave: u8, values: &[u16]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(5 + values.len() * 2);
    frame.push(slave);
    frame.push(READ_HOLDING);
    frame.push((values.len() * 2) as u8);
    for value in values {
        frame.extend_from_slice(&value.to_be_bytes());
    }
    append_crc(&mut frame);
    frame
}

pub fn encode_exception(slave: u8, function: u8, code: u8) -> Vec<u8> {
    let mut frame = vec![slave, function | EXCEPTION_FLAG, code];
    append_crc(&mut frame);
    frame
}

/// Reads one complete response to `request`, header first so the remaining length is known.
pub fn read_response(reader: &mut impl Read, request: &Request) -> GripResult<Vec<u8>> {
    let mut frame = vec![0u8; 2];
    reader.read_exact(&mut frame)?;
    let (slave, function) = (frame[0], frame[1]);
    if slave != request.slave() {
        return Err(GripError::TransportFailure(format!(
            "response from slave {slave}, expected {}", request.slave())));
    }

    let remaining = if function == request.function() | EXCEPTION_FLAG {
        3
    } else if function != request.function() {
        return Err(GripError::TransportFailure(format!(
            "response function {function:#04x}, expected {:#04x}", request.function())));
    } else {
        match request {
            Request::ReadHolding { .. } => {
                let mut byte_count = [0u8; 1];
                reader.read_exact(&mut byte_count)?;
                frame.push(byte_count[0]);
                usize::from(byte_count[0]) + 2
            }
            Request::WriteSingle { .. } => 6,
        }
    };
    let start = frame.len();
    frame.resize(start + remaining, 0);
    reader.read_exact(&mut frame[start..])?;
    debug!("<- {frame:02x?}");

    let body = strip_crc(&frame)?;
    if body[1] & EXCEPTION_FLAG != 0 {
        return Err(GripError::ModbusException { function: request.function(), code: body[2] });
    }
    Ok(frame)
}

/// Register values from a read response, checking it against the request that produced it.
pub fn decode_read_response(request: &Request, frame: &[u8]) -> GripResult<Vec<u16>> {
    let count = match *request {
        Request::ReadHolding { count, .. } => count,
        Request::WriteSingle { .. } => {
            return Err(GripError::TransportFailure(String::from("not a read request")));
        }
    };
    let body = strip_crc(frame)?;
    if body.len() < 3 || body[0] != request.slave() || body[1] != READ_HOLDING {
        return Err(GripError::TransportFailure(format!("unexpected read response {body:02x?}")));
    }
    let byte_count = usize::from(body[2]);
    if byte_count != usize::from(count) * 2 || body.len() != 3 + byte_count {
        return Err(GripError::TransportFailure(format!(
            "byte count {byte_count} for {count} registers")));
    }
    Ok(body[3..]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// A single-register write succeeds only when the device echoes the request verbatim.
pub fn verify_write_echo(request: &[u8], response: &[u8]) -> GripResult<()> {
    if request != response {
        return Err(GripError::TransportFailure(format!(
            "write echo mismatch: sent {request:02x?}, got {response:02x?}")));
    }
    Ok(())
}
