//! Modbus RTU session with the gripper over any [`Transport`].

use std::thread;

use log::{debug, info, warn};

use crate::grip_error::{GripError, GripResult};
use crate::gripper_hal::{GripperHal, LinkTiming, SaveOutcome, Transport};
use crate::gripper_registers::{
    check_comm_address, check_grip_current, check_grip_speed, ControlMode, GripperStatus, Register,
};
use crate::modbus_frame::{self, Request, MAX_READ_COUNT};

pub struct ModbusGripper<T: Transport> {
    transport: Option<T>,
    slave_id: u8,
    timing: LinkTiming,
    last_status: Option<GripperStatus>,
}

impl<T: Transport> ModbusGripper<T> {
    pub fn new(transport: T, slave_id: u8) -> Self {
        Self { transport: Some(transport), slave_id, timing: LinkTiming::default(), last_status: None }
    }

    pub fn with_timing(mut self, timing: LinkTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn slave_id(&self) -> u8 {
        self.slave_id
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Status from the most recent successful status read.
    pub fn last_status(&self) -> Option<GripperStatus> {
        self.last_status
    }

    fn exchange(&mut self, request: Request) -> GripResult<Vec<u8>> {
        let transport = self.transport.as_mut().ok_or(GripError::NotConnected)?;
        let bytes = request.encode();
        transport.clear_input()?;
        debug!("-> {bytes:02x?}");
        transport.write_all(&bytes)?;
        transport.flush()?;
        modbus_frame::read_response(transport, &request)
    }

    fn write_address(&mut self, address: u16, value: u16) -> GripResult<()> {
        let request = Request::WriteSingle { slave: self.slave_id, address, value };
        let response = self.exchange(request)?;
        modbus_frame::verify_write_echo(&request.encode(), &response)
    }

    pub fn write_single(&mut self, register: Register, value: u16) -> GripResult<()> {
        self.write_address(register.address(), value)
    }

    /// Writes a 32-bit value as two single-register writes, low word first.
    pub fn write_double(&mut self, register: Register, value: u32) -> GripResult<()> {
        let low = (value & 0xFFFF) as u16;
        let high = (value >> 16) as u16;
        self.write_address(register.address(), low)?;
        thread::sleep(self.timing.inter_write);
        self.write_address(register.address() + 1, high)
    }

    pub fn read(&mut self, register: Register, count: u16) -> GripResult<Vec<u16>> {
        if count == 0 || count > MAX_READ_COUNT {
            return Err(GripError::out_of_range("register count", count, (1, MAX_READ_COUNT.into())));
        }
        let request = Request::ReadHolding { slave: self.slave_id, start: register.address(), count };
        let response = self.exchange(request)?;
        modbus_frame::decode_read_response(&request, &response)
    }

    fn read_one(&mut self, register: Register) -> GripResult<u16> {
        let values = self.read(register, 1)?;
        values.first().copied()
            .ok_or_else(|| GripError::TransportFailure(format!("empty read of {register}")))
    }

    fn read_double(&mut self, register: Register) -> GripResult<u32> {
        match self.read(register, 2)?.as_slice() {
            &[low, high] => Ok(u32::from(low) | (u32::from(high) << 16)),
            other => Err(GripError::TransportFailure(format!("expected 2 registers, got {}", other.len()))),
        }
    }
}

impl<T: Transport> GripperHal for ModbusGripper<T> {
    fn test_connection(&mut self) -> GripResult<GripperStatus> {
        let status = self.status()?;
        info!("Gripper {} answered, status {status}", self.slave_id);
        Ok(status)
    }

    fn set_control_mode(&mut self, mode: ControlMode) -> GripResult<()> {
        self.write_single(Register::ControlMode, mode.code())?;
        info!("Control mode set to {mode:?}");
        Ok(())
    }

    fn grip(&mut self) -> GripResult<()> {
        self.write_single(Register::GripCommand, 1)?;
        info!("Grip command sent");
        Ok(())
    }

    fn release(&mut self) -> GripResult<()> {
        self.write_single(Register::ReleaseCommand, 1)?;
        info!("Release command sent");
        Ok(())
    }

    fn set_grip_current(&mut self, current: u16) -> GripResult<()> {
        let current = check_grip_current(current)?;
        self.write_single(Register::GripCurrent, current)?;
        info!("Grip current set to {current}");
        Ok(())
    }

    fn set_grip_speed(&mut self, speed: u32) -> GripResult<()> {
        let speed = check_grip_speed(speed)?;
        self.write_double(Register::GripSpeed, speed)?;
        info!("Grip speed set to {speed}");
        Ok(())
    }

    fn set_grip_position(&mut self, position: u32) -> GripResult<()> {
        self.write_double(Register::GripPosition, position)
    }

    fn set_release_position(&mut self, position: u32) -> GripResult<()> {
        self.write_double(Register::ReleasePosition, position)
    }

    fn status(&mut self) -> GripResult<GripperStatus> {
        let status = GripperStatus::from(self.read_one(Register::Status)?);
        self.last_status = Some(status);
        Ok(status)
    }

    fn current(&mut self) -> GripResult<u16> {
        self.read_one(Register::CurrentRead)
    }

    fn speed(&mut self) -> GripResult<u32> {
        self.read_double(Register::SpeedRead)
    }

    fn set_auto_find_on_power(&mut self, enabled: bool) -> GripResult<()> {
        self.write_single(Register::AutoFindOnPower, u16::from(enabled))
    }

    fn reset_find_travel(&mut self) -> GripResult<()> {
        self.write_single(Register::ResetFindTravel, 1)
    }

    fn set_comm_address(&mut self, address: u8) -> GripResult<()> {
        let address = check_comm_address(address)?;
        self.write_single(Register::CommAddress, address.into())?;
        self.write_single(Register::SaveComm, 1)?;
        info!("Gripper address changed {} -> {address}", self.slave_id);
        self.slave_id = address;
        Ok(())
    }

    fn save_config(&mut self) -> GripResult<SaveOutcome> {
        self.write_single(Register::SaveConfig, 1)?;
        for attempt in 1..=self.timing.save_poll_attempts {
            thread::sleep(self.timing.save_poll_interval);
            match self.read_one(Register::SaveConfig) {
                Ok(0) => {
                    info!("Config saved");
                    return Ok(SaveOutcome::Confirmed);
                }
                Ok(_) => {}
                Err(e) => debug!("save poll {attempt}: {e}"),
            }
        }
        warn!("Config save not confirmed after {} polls", self.timing.save_poll_attempts);
        Ok(SaveOutcome::Unconfirmed)
    }

    fn disconnect(&mut self) {
        if self.transport.take().is_some() {
            info!("Gripper link closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::gripper_hal_mock::{Fault, SimulatedGripper};

    use super::*;

    fn link() -> (ModbusGripper<SimulatedGripper>, SimulatedGripper) {
        let device = SimulatedGripper::new(1);
        let link = ModbusGripper::new(device.clone(), 1).with_timing(LinkTiming::immediate());
        (link, device)
    }

    #[test]
    fn test_grip_and_status() {
        let (mut link, device) = link();
        link.set_control_mode(ControlMode::Serial).unwrap();
        link.grip().unwrap();
        assert_eq!(device.register(Register::GripCommand.address()), 1);
        assert_eq!(link.status(), Ok(GripperStatus::GrippedObject));
        assert_eq!(link.last_status(), Some(GripperStatus::GrippedObject));
        link.release().unwrap();
        assert_eq!(link.status(), Ok(GripperStatus::ReleaseComplete));
    }

    #[test]
    fn test_out_of_range_never_transmitted() {
        let (mut link, device) = link();
        assert!(matches!(link.set_grip_current(2500), Err(GripError::OutOfRange { .. })));
        assert!(matches!(link.set_grip_speed(5), Err(GripError::OutOfRange { .. })));
        assert!(matches!(link.set_comm_address(0), Err(GripError::OutOfRange { .. })));
        assert_eq!(device.requests_seen(), 0);
    }

    #[test]
    fn test_write_double_low_word_first() {
        let (mut link, device) = link();
        link.set_grip_speed(2000).unwrap();
        assert_eq!(device.register(0x0045), 2000);
        assert_eq!(device.register(0x0046), 0);

        link.set_grip_position(0x0001_86A0).unwrap();
        assert_eq!(device.register(0x003A), 0x86A0);
        assert_eq!(device.register(0x003B), 0x0001);
    }

    #[test]
    fn test_write_double_fails_if_either_half_fails() {
        let (mut link, device) = link();
        device.inject_after(1, Fault::CorruptEcho);
        assert!(link.set_grip_speed(1500).is_err());
    }

    #[test]
    fn test_speed_read_combines_words() {
        let (mut link, device) = link();
        device.set_register(0x0042, 0x2345);
        device.set_register(0x0043, 0x0001);
        assert_eq!(link.speed(), Ok(0x0001_2345));
    }

    #[test]
    fn test_timeout_is_transport_failure() {
        let (mut link, device) = link();
        device.inject(Fault::Silent);
        assert_eq!(link.grip(), Err(GripError::TransportFailure(String::from("read timed out"))));
    }

    #[test]
    fn test_corrupted_response_rejected() {
        let (mut link, device) = link();
        device.inject(Fault::CorruptCrc);
        assert!(matches!(link.status(), Err(GripError::TransportFailure(_))));
        assert_eq!(link.last_status(), None);
    }

    #[test]
    fn test_read_only_register_write_raises_exception() {
        let (mut link, _device) = link();
        assert_eq!(
            link.write_single(Register::Status, 1),
            Err(GripError::ModbusException { function: 0x06, code: 0x02 }));
    }

    #[test]
    fn test_save_config_confirmed() {
        let (mut link, _device) = link();
        assert_eq!(link.save_config(), Ok(SaveOutcome::Confirmed));
    }

    #[test]
    fn test_save_config_unconfirmed() {
        let (mut link, device) = link();
        device.set_save_never_clears(true);
        assert_eq!(link.save_config(), Ok(SaveOutcome::Unconfirmed));
    }

    #[test]
    fn test_comm_address_change() {
        let (mut link, device) = link();
        link.set_comm_address(7).unwrap();
        assert_eq!(link.slave_id(), 7);
        assert_eq!(device.slave_id(), 7);
        assert!(link.status().is_ok());
    }

    #[test]
    fn test_disconnected_link() {
        let (mut link, _device) = link();
        link.disconnect();
        assert!(!link.is_connected());
        assert_eq!(link.grip(), Err(GripError::NotConnected));
    }
}
