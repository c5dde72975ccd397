//! Binary telemetry protocol for the solar-panel cleaning robot fleet
//!
//! This crate implements the framed byte protocol spoken between simulated
//! robots and the LoRa/IoT platform, plus the JSON envelope that carries
//! frames over the message broker.

pub mod alarms;
pub mod commands;
pub mod encoding;
pub mod envelope;
pub mod frame;
pub mod types;

pub use alarms::{BatteryAlarms, EnvironmentAlarms, FaultAlarms, MotorAlarms};
pub use commands::{
    CleanRecord, Identifier, LoraParamSet, ProtectionFlags, StartReply, TimeStatusBlock,
};
pub use envelope::{dev_addr, DownlinkEnvelope, UplinkTemplate};
pub use frame::{Frame, CONTROL_DOWNLINK, CONTROL_UPLINK, FRAME_HEADER, FRAME_TAIL};
pub use types::{CodecError, EnvelopeError};
