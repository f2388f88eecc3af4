use std::time::Duration;

use anyhow::Context;
use log::info;
use serialport::{DataBits, Parity, StopBits};

use crate::gripper_hal::{GripperHal, LinkTiming};
use crate::gripper_hal_mock::SimulatedGripper;
use crate::gripper_link::ModbusGripper;

#[derive(Debug, Clone, PartialEq)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    pub slave_id: u8,
    pub timeout: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: String::from("/dev/ttyUSB0"),
            baud_rate: 115200,
            slave_id: 1,
            timeout: Duration::from_millis(1000),
        }
    }
}

#[derive(Default)]
pub struct GripperHalFactory {
    force_mock: bool,
    settings: SerialSettings,
}

impl GripperHalFactory {
    pub fn new(settings: SerialSettings) -> Self {
        Self { force_mock: false, settings }
    }

    pub fn new_maybe_mock(force_mock: bool, settings: SerialSettings) -> Self {
        Self { force_mock, settings }
    }

    pub fn create_hal(&self) -> anyhow::Result<Box<dyn GripperHal>> {
        let settings = &self.settings;
        if self.force_mock {
            info!("Using simulated gripper (slave {})", settings.slave_id);
            let device = SimulatedGripper::new(settings.slave_id);
            let link = ModbusGripper::new(device, settings.slave_id).with_timing(LinkTiming::immediate());
            return Ok(Box::new(link));
        }

        // 8N1 is the only framing the gripper supports.
        let port = serialport::new(&settings.port, settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(settings.timeout)
            .open()
            .with_context(|| format!("Opening serial port {}", settings.port))?;
        info!("Opened {} at {} baud", settings.port, settings.baud_rate);
        Ok(Box::new(ModbusGripper::new(port, settings.slave_id)))
    }
}
