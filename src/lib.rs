pub mod displacement;
pub mod feature_history;
pub mod grasp_config;
pub mod grasp_controller;
pub mod grasp_runner;
pub mod grip_error;
pub mod gripper_hal;
pub mod gripper_hal_factory;
pub mod gripper_hal_mock;
pub mod gripper_link;
pub mod gripper_registers;
pub mod modbus_frame;
pub mod signal_detectors;
pub mod tactile_hal;
pub mod tactile_hal_factory;
pub mod tactile_hal_mock;
pub mod tactile_hal_replay;
pub mod tracking_channel;
