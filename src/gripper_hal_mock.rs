//! In-memory gripper that answers real Modbus frames, for tests and `--fake-hw` runs.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::rc::Rc;

use conv::{ConvUtil, RoundToNearest};
use log::{debug, trace};

use crate::grip_error::GripResult;
use crate::gripper_hal::Transport;
use crate::gripper_registers::{ControlMode, GripperStatus, Register};
use crate::modbus_frame::{self, Request};

const ILLEGAL_ADDRESS: u8 = 0x02;
const ILLEGAL_VALUE: u8 = 0x03;

/// Fraction of the commanded current drawn while clamping an object.
const HOLDING_CURRENT_RATIO: f64 = 0.92;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Fault {
    /// Swallow the request; the reader times out.
    Silent,
    CorruptCrc,
    /// Echo a write with a different value but a valid CRC.
    CorruptEcho,
}

#[derive(Debug)]
struct Device {
    slave_id: u8,
    registers: HashMap<u16, u16>,
    status: GripperStatus,
    object_present: bool,
    save_never_clears: bool,
    pending_comm_address: Option<u8>,
    faults: VecDeque<Option<Fault>>,
    requests_seen: usize,
    inbox: Vec<u8>,
    outbox: VecDeque<u8>,
}

/// Handle to a simulated device; clones share the same device.
#[derive(Debug, Clone)]
pub struct SimulatedGripper {
    device: Rc<RefCell<Device>>,
}

impl SimulatedGripper {
    pub fn new(slave_id: u8) -> Self {
        let device = Device {
            slave_id,
            registers: HashMap::new(),
            status: GripperStatus::Idle,
            object_present: true,
            save_never_clears: false,
            pending_comm_address: None,
            faults: VecDeque::new(),
            requests_seen: 0,
            inbox: Vec::new(),
            outbox: VecDeque::new(),
        };
        Self { device: Rc::new(RefCell::new(device)) }
    }

    pub fn slave_id(&self) -> u8 {
        self.device.borrow().slave_id
    }

    pub fn register(&self, address: u16) -> u16 {
        self.device.borrow().registers.get(&address).copied().unwrap_or(0)
    }

    pub fn set_register(&self, address: u16, value: u16) {
        self.device.borrow_mut().registers.insert(address, value);
    }

    pub fn status(&self) -> GripperStatus {
        self.device.borrow().status
    }

    /// Whether a grip closes on something (status 1) or on air (status 2).
    pub fn set_object_present(&self, present: bool) {
        self.device.borrow_mut().object_present = present;
    }

    pub fn set_save_never_clears(&self, never: bool) {
        self.device.borrow_mut().save_never_clears = never;
    }

    pub fn requests_seen(&self) -> usize {
        self.device.borrow().requests_seen
    }

    /// Spoils the next response.
    pub fn inject(&self, fault: Fault) {
        self.device.borrow_mut().faults.push_back(Some(fault));
    }

    /// Lets `responses` go through untouched, then spoils one.
    pub fn inject_after(&self, responses: usize, fault: Fault) {
        let mut device = self.device.borrow_mut();
        device.faults.extend(std::iter::repeat(None).take(responses));
        device.faults.push_back(Some(fault));
    }

    pub fn inject_times(&self, fault: Fault, times: usize) {
        self.device.borrow_mut().faults.extend(std::iter::repeat(Some(fault)).take(times));
    }
}

impl Device {
    fn handle(&mut self, frame: &[u8]) {
        self.requests_seen += 1;
        let request = match Request::decode(frame) {
            Ok(request) => request,
            Err(e) => {
                debug!("simulated gripper dropped frame: {e}");
                return;
            }
        };
        if request.slave() != self.slave_id {
            trace!("frame for slave {} ignored", request.slave());
            return;
        }

        let fault = self.faults.pop_front().flatten();
        let mut response = self.respond(&request, frame);
        match fault {
            Some(Fault::Silent) => return,
            Some(Fault::CorruptCrc) => {
                if let Some(last) = response.last_mut() {
                    *last ^= 0xFF;
                }
            }
            Some(Fault::CorruptEcho) if response.len() == 8 => {
                response.truncate(6);
                response[5] ^= 0x01;
                modbus_frame::append_crc(&mut response);
            }
            _ => {}
        }
        self.outbox.extend(response);
    }

    fn respond(&mut self, request: &Request, frame: &[u8]) -> Vec<u8> {
        let function = request.function();
        let result = match *request {
            Request::ReadHolding { start, count, .. } => self.read_registers(start, count)
                .map(|values| modbus_frame::encode_read_response(self.slave_id, &values)),
            Request::WriteSingle { address, value, .. } => self.write_register(address, value)
                .map(|()| frame.to_vec()),
        };
        result.unwrap_or_else(|code| modbus_frame::encode_exception(self.slave_id, function, code))
    }

    fn known(address: u16) -> Option<Register> {
        Register::from_address(address).or_else(|| {
            address.checked_sub(1)
                .and_then(Register::from_address)
                .filter(|r| r.width() == 2)
        })
    }

    fn read_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>, u8> {
        (start..start.saturating_add(count))
            .map(|address| self.read_register(address))
            .collect()
    }

    fn read_register(&mut self, address: u16) -> Result<u16, u8> {
        let register = Device::known(address).ok_or(ILLEGAL_ADDRESS)?;
        let stored = self.registers.get(&address).copied().unwrap_or(0);
        Ok(match register {
            Register::Status => self.status.code(),
            Register::CurrentRead => self.holding_current(),
            Register::SaveConfig if !self.save_never_clears => {
                self.registers.insert(address, 0);
                0
            }
            _ => stored,
        })
    }

    fn holding_current(&self) -> u16 {
        if self.status != GripperStatus::GrippedObject {
            return 0;
        }
        let commanded = f64::from(self.registers.get(&Register::GripCurrent.address()).copied().unwrap_or(0));
        (commanded * HOLDING_CURRENT_RATIO).approx_as_by::<u16, RoundToNearest>().unwrap_or(u16::MAX)
    }

    fn write_register(&mut self, address: u16, value: u16) -> Result<(), u8> {
        let register = Device::known(address).ok_or(ILLEGAL_ADDRESS)?;
        if register.is_read_only() {
            return Err(ILLEGAL_ADDRESS);
        }
        match register {
            Register::ControlMode => {
                ControlMode::try_from(value).map_err(|_| ILLEGAL_VALUE)?;
            }
            Register::GripCommand if value == 1 => {
                self.status = if self.object_present {
                    GripperStatus::GrippedObject
                } else {
                    GripperStatus::GrippedNothing
                };
            }
            Register::ReleaseCommand if value == 1 => self.status = GripperStatus::ReleaseComplete,
            Register::CommAddress => {
                let address = u8::try_from(value).map_err(|_| ILLEGAL_VALUE)?;
                self.pending_comm_address = Some(address);
            }
            Register::SaveComm if value == 1 => {
                if let Some(address) = self.pending_comm_address.take() {
                    self.slave_id = address;
                }
            }
            _ => {}
        }
        self.registers.insert(address, value);
        Ok(())
    }
}

impl Write for SimulatedGripper {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut device = self.device.borrow_mut();
        device.inbox.extend_from_slice(buf);
        // Both request kinds the link sends are eight bytes long.
        while device.inbox.len() >= 8 {
            let frame: Vec<u8> = device.inbox.drain(..8).collect();
            device.handle(&frame);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for SimulatedGripper {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut device = self.device.borrow_mut();
        if device.outbox.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "simulated read timeout"));
        }
        let n = buf.len().min(device.outbox.len());
        for (slot, byte) in buf.iter_mut().zip(device.outbox.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Transport for SimulatedGripper {
    fn clear_input(&mut self) -> GripResult<()> {
        self.device.borrow_mut().outbox.clear();
        Ok(())
    }
}
