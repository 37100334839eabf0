//! Gen1 commands
//!
//! Every request is answered with a frame carrying the same command id,
//! except `EnterUpdateMode` (the device drops into its bootloader) and
//! failures, which come back as a `DeviceError` frame naming the command.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use super::frame::OutgoingFrame;
use super::records::FlashBlock;
use crate::telemetry::Range;

/// Protocol commands for the Gen1 analyzer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// Liveness probe
    AreYouThere,
    /// Firmware version string
    ReadVersion,
    /// Primary pump on/off
    PumpControl,
    /// Hardware sample-averaging depth
    SetSamplingParameters,
    /// Front-end gain range
    SetRange,
    /// Unsolicited status reporting on/off
    SetPeriodicReporting,
    ReadFlash,
    WriteFlash,
    /// Start the glow-plug ignition sequence
    Ignite,
    ReadStatus,
    ReadCalibration,
    GenerateCalibration,
    ClearCalibration,
    /// Password-gated switch into the firmware bootloader
    EnterUpdateMode,
    /// Inbound only: a previous command failed
    DeviceError,
}

impl Command {
    pub const ALL: [Command; 15] = [
        Command::AreYouThere,
        Command::ReadVersion,
        Command::PumpControl,
        Command::SetSamplingParameters,
        Command::SetRange,
        Command::SetPeriodicReporting,
        Command::ReadFlash,
        Command::WriteFlash,
        Command::Ignite,
        Command::ReadStatus,
        Command::ReadCalibration,
        Command::GenerateCalibration,
        Command::ClearCalibration,
        Command::EnterUpdateMode,
        Command::DeviceError,
    ];

    /// Command id byte on the wire
    pub fn id(&self) -> u8 {
        match self {
            Command::AreYouThere => 0x01,
            Command::ReadVersion => 0x02,
            Command::PumpControl => 0x05,
            Command::SetSamplingParameters => 0x09,
            Command::SetRange => 0x0A,
            Command::SetPeriodicReporting => 0x0C,
            Command::ReadFlash => 0x1E,
            Command::WriteFlash => 0x1F,
            Command::Ignite => 0x20,
            Command::ReadStatus => 0x25,
            Command::ReadCalibration => 0x2C,
            Command::GenerateCalibration => 0x2D,
            Command::ClearCalibration => 0x2E,
            Command::EnterUpdateMode => 0x3D,
            Command::DeviceError => 0x7F,
        }
    }

    /// Look up a command by id
    pub fn from_id(id: u8) -> Option<Command> {
        Command::ALL.iter().copied().find(|c| c.id() == id)
    }

    /// Short name used in logs and error records
    pub fn name(&self) -> &'static str {
        match self {
            Command::AreYouThere => "AreYouThere",
            Command::ReadVersion => "ReadVersion",
            Command::PumpControl => "PumpControl",
            Command::SetSamplingParameters => "SetSamplingParameters",
            Command::SetRange => "SetRange",
            Command::SetPeriodicReporting => "SetPeriodicReporting",
            Command::ReadFlash => "ReadFlash",
            Command::WriteFlash => "WriteFlash",
            Command::Ignite => "Ignite",
            Command::ReadStatus => "ReadStatus",
            Command::ReadCalibration => "ReadCalibration",
            Command::GenerateCalibration => "GenerateCalibration",
            Command::ClearCalibration => "ClearCalibration",
            Command::EnterUpdateMode => "EnterUpdateMode",
            Command::DeviceError => "DeviceError",
        }
    }

    /// Check if this command expects a framed response
    pub fn expects_response(&self) -> bool {
        !matches!(self, Command::EnterUpdateMode | Command::DeviceError)
    }

    /// Typical response time, used when the caller gives no timeout
    pub fn timeout_ms(&self) -> u64 {
        match self {
            Command::GenerateCalibration => 15_000, // averages the flame for several seconds
            Command::Ignite => 5_000,
            Command::WriteFlash => 1_500,
            Command::ReadStatus | Command::AreYouThere => 500,
            _ => 1_000,
        }
    }

    /// Frame for this command with an empty body
    pub fn frame(&self) -> OutgoingFrame {
        OutgoingFrame::new(self.id(), Vec::new())
    }

    /// Frame for this command with the given body
    pub fn frame_with(&self, payload: Vec<u8>) -> OutgoingFrame {
        OutgoingFrame::new(self.id(), payload)
    }
}

/// Builders for command bodies
pub mod build {
    use super::*;

    pub fn set_range(range: Range) -> OutgoingFrame {
        Command::SetRange.frame_with(vec![range.wire_value()])
    }

    pub fn set_averaging_depth(depth: u8) -> OutgoingFrame {
        Command::SetSamplingParameters.frame_with(vec![depth])
    }

    /// `period_ds` is the reporting period in tenths of a second
    pub fn set_periodic_reporting(enabled: bool, period_ds: u8) -> OutgoingFrame {
        Command::SetPeriodicReporting.frame_with(vec![enabled as u8, period_ds])
    }

    pub fn pump(on: bool) -> OutgoingFrame {
        Command::PumpControl.frame_with(vec![on as u8])
    }

    /// `glow_plug_ms` is the glow plug duration in milliseconds
    pub fn ignite(glow_plug_ms: u16) -> OutgoingFrame {
        let mut body = [0u8; 2];
        LittleEndian::write_u16(&mut body, glow_plug_ms);
        Command::Ignite.frame_with(body.to_vec())
    }

    pub fn read_flash(address: u32, length: u8) -> OutgoingFrame {
        Command::ReadFlash.frame_with(FlashBlock::request(address, length).pack())
    }

    pub fn write_flash(address: u32, data: &[u8]) -> OutgoingFrame {
        let block = FlashBlock {
            address,
            length: data.len() as u8,
            data: data.to_vec(),
        };
        Command::WriteFlash.frame_with(block.pack())
    }

    pub fn read_calibration(index: u8) -> OutgoingFrame {
        Command::ReadCalibration.frame_with(vec![index])
    }

    /// `ppm_x10` is the reference gas concentration in tenths of a ppm
    pub fn generate_calibration(index: u8, ppm_x10: u32) -> OutgoingFrame {
        let mut body = vec![index, 0, 0, 0, 0];
        LittleEndian::write_u32(&mut body[1..5], ppm_x10);
        Command::GenerateCalibration.frame_with(body)
    }

    pub fn clear_calibration(index: u8) -> OutgoingFrame {
        Command::ClearCalibration.frame_with(vec![index])
    }

    pub fn enter_update_mode(password: u32) -> OutgoingFrame {
        let mut body = [0u8; 4];
        LittleEndian::write_u32(&mut body, password);
        Command::EnterUpdateMode.frame_with(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_ids_unique_and_reversible() {
        for cmd in Command::ALL {
            assert_eq!(Command::from_id(cmd.id()), Some(cmd));
        }
        assert_eq!(Command::from_id(0xEE), None);
    }

    #[test]
    fn test_command_response() {
        assert!(Command::ReadStatus.expects_response());
        assert!(!Command::EnterUpdateMode.expects_response());
    }

    #[test]
    fn test_write_flash_body() {
        let frame = build::write_flash(0x100, &[1, 2, 3]);
        assert_eq!(frame.command_id, 0x1F);
        assert_eq!(frame.payload, vec![0x00, 0x01, 0x00, 0x00, 3, 1, 2, 3]);
    }

    #[test]
    fn test_generate_calibration_body() {
        let frame = build::generate_calibration(1, 5000);
        assert_eq!(frame.payload, vec![1, 0x88, 0x13, 0, 0]);
    }
}
