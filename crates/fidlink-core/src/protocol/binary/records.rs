//! Fixed-layout Gen1 payload records
//!
//! Every multi-byte field is little-endian. Offsets are part of the device
//! firmware ABI and must not move.

use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, TimeZone, Utc};

use crate::device::CalibrationSlot;
use crate::protocol::ProtocolError;
use crate::telemetry::{Range, RawSample};

/// Status record returned by `ReadStatus` (28 bytes)
///
/// | offset | type | field                                  |
/// |--------|------|----------------------------------------|
/// | 0      | u16  | battery, millivolts                    |
/// | 2      | i32  | FID current, pico-amps x10             |
/// | 6      | i16  | thermocouple, deg C x10                |
/// | 8      | i16  | internal temperature, deg C x10        |
/// | 10     | u16  | H2 tank pressure, psi x10              |
/// | 12     | u16  | H2 low-side pressure, psi x10          |
/// | 14     | u16  | sample pressure, psia x100             |
/// | 16     | u16  | pump power, percent x10                |
/// | 18     | u16  | pump current, mA                       |
/// | 20     | u8   | flags (see `FLAG_*`)                   |
/// | 21     | u8   | hardware averaging depth               |
/// | 22     | u16  | reserved                               |
/// | 24     | i32  | raw ppm x10                            |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusRecord {
    pub battery_mv: u16,
    pub pico_amps_x10: i32,
    pub thermocouple_x10: i16,
    pub internal_temp_x10: i16,
    pub h2_tank_psi_x10: u16,
    pub h2_low_psi_x10: u16,
    pub sample_psia_x100: u16,
    pub pump_power_x10: u16,
    pub pump_current_ma: u16,
    pub flags: u8,
    pub averaging_depth: u8,
    pub raw_ppm_x10: i32,
}

pub const FLAG_PRIMARY_SOLENOID: u8 = 1 << 0;
pub const FLAG_SECONDARY_SOLENOID: u8 = 1 << 1;
pub const FLAG_PRIMARY_PUMP: u8 = 1 << 2;
pub const FLAG_SECONDARY_PUMP: u8 = 1 << 3;
pub const FLAG_GLOW_PLUG: u8 = 1 << 4;
pub const FLAG_MAX_RANGE: u8 = 1 << 5;

impl StatusRecord {
    pub const SIZE: usize = 28;

    pub fn unpack(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < Self::SIZE {
            return Err(ProtocolError::InvalidResponse(format!(
                "status record needs {} bytes, got {}",
                Self::SIZE,
                data.len()
            )));
        }
        Ok(Self {
            battery_mv: LittleEndian::read_u16(&data[0..2]),
            pico_amps_x10: LittleEndian::read_i32(&data[2..6]),
            thermocouple_x10: LittleEndian::read_i16(&data[6..8]),
            internal_temp_x10: LittleEndian::read_i16(&data[8..10]),
            h2_tank_psi_x10: LittleEndian::read_u16(&data[10..12]),
            h2_low_psi_x10: LittleEndian::read_u16(&data[12..14]),
            sample_psia_x100: LittleEndian::read_u16(&data[14..16]),
            pump_power_x10: LittleEndian::read_u16(&data[16..18]),
            pump_current_ma: LittleEndian::read_u16(&data[18..20]),
            flags: data[20],
            averaging_depth: data[21],
            raw_ppm_x10: LittleEndian::read_i32(&data[24..28]),
        })
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut out = vec![0u8; Self::SIZE];
        LittleEndian::write_u16(&mut out[0..2], self.battery_mv);
        LittleEndian::write_i32(&mut out[2..6], self.pico_amps_x10);
        LittleEndian::write_i16(&mut out[6..8], self.thermocouple_x10);
        LittleEndian::write_i16(&mut out[8..10], self.internal_temp_x10);
        LittleEndian::write_u16(&mut out[10..12], self.h2_tank_psi_x10);
        LittleEndian::write_u16(&mut out[12..14], self.h2_low_psi_x10);
        LittleEndian::write_u16(&mut out[14..16], self.sample_psia_x100);
        LittleEndian::write_u16(&mut out[16..18], self.pump_power_x10);
        LittleEndian::write_u16(&mut out[18..20], self.pump_current_ma);
        out[20] = self.flags;
        out[21] = self.averaging_depth;
        LittleEndian::write_i32(&mut out[24..28], self.raw_ppm_x10);
        out
    }

    fn flag(&self, mask: u8) -> bool {
        self.flags & mask != 0
    }

    /// Convert to engineering units
    pub fn to_raw_sample(&self) -> RawSample {
        RawSample {
            battery_volts: self.battery_mv as f64 / 1000.0,
            pico_amps: self.pico_amps_x10 as f64 / 10.0,
            thermocouple_c: self.thermocouple_x10 as f64 / 10.0,
            internal_temp_c: self.internal_temp_x10 as f64 / 10.0,
            h2_tank_psi: self.h2_tank_psi_x10 as f64 / 10.0,
            h2_low_psi: self.h2_low_psi_x10 as f64 / 10.0,
            sample_psia: self.sample_psia_x100 as f64 / 100.0,
            pump_power_pct: self.pump_power_x10 as f64 / 10.0,
            pump_current_ma: self.pump_current_ma as f64,
            raw_ppm: self.raw_ppm_x10 as f64 / 10.0,
            primary_solenoid: self.flag(FLAG_PRIMARY_SOLENOID),
            secondary_solenoid: self.flag(FLAG_SECONDARY_SOLENOID),
            primary_pump: self.flag(FLAG_PRIMARY_PUMP),
            secondary_pump: self.flag(FLAG_SECONDARY_PUMP),
            glow_plug: self.flag(FLAG_GLOW_PLUG),
            range: if self.flag(FLAG_MAX_RANGE) {
                Range::Max
            } else {
                Range::Low
            },
            hardware_averaging: self.averaging_depth,
        }
    }
}

/// Calibration slot record (16 bytes)
///
/// | offset | type | field                            |
/// |--------|------|----------------------------------|
/// | 0      | u8   | slot index                       |
/// | 1      | u8   | bit0 valid, bit1 factory         |
/// | 2      | u32  | ppm x10                          |
/// | 6      | i32  | FID current, pico-amps x10       |
/// | 10     | u16  | H2 pressure, psi x10             |
/// | 12     | u32  | timestamp, unix seconds          |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CalibrationRecord {
    pub index: u8,
    pub flags: u8,
    pub ppm_x10: u32,
    pub fid_current_x10: i32,
    pub h2_psi_x10: u16,
    pub timestamp: u32,
}

impl CalibrationRecord {
    pub const SIZE: usize = 16;

    pub fn unpack(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < Self::SIZE {
            return Err(ProtocolError::InvalidResponse(format!(
                "calibration record needs {} bytes, got {}",
                Self::SIZE,
                data.len()
            )));
        }
        Ok(Self {
            index: data[0],
            flags: data[1],
            ppm_x10: LittleEndian::read_u32(&data[2..6]),
            fid_current_x10: LittleEndian::read_i32(&data[6..10]),
            h2_psi_x10: LittleEndian::read_u16(&data[10..12]),
            timestamp: LittleEndian::read_u32(&data[12..16]),
        })
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut out = vec![0u8; Self::SIZE];
        out[0] = self.index;
        out[1] = self.flags;
        LittleEndian::write_u32(&mut out[2..6], self.ppm_x10);
        LittleEndian::write_i32(&mut out[6..10], self.fid_current_x10);
        LittleEndian::write_u16(&mut out[10..12], self.h2_psi_x10);
        LittleEndian::write_u32(&mut out[12..16], self.timestamp);
        out
    }

    pub fn to_slot(&self) -> CalibrationSlot {
        let timestamp: Option<DateTime<Utc>> = Utc.timestamp_opt(self.timestamp as i64, 0).single();
        CalibrationSlot {
            index: self.index,
            ppm: self.ppm_x10 as f64 / 10.0,
            fid_current: self.fid_current_x10 as f64 / 10.0,
            h2_pressure: self.h2_psi_x10 as f64 / 10.0,
            is_valid: self.flags & 0x01 != 0,
            timestamp,
            is_factory: self.flags & 0x02 != 0,
        }
    }
}

/// Flash access header: `u32 address, u8 length`, optionally followed by data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashBlock {
    pub address: u32,
    pub length: u8,
    pub data: Vec<u8>,
}

impl FlashBlock {
    pub const HEADER_SIZE: usize = 5;

    pub fn request(address: u32, length: u8) -> Self {
        Self {
            address,
            length,
            data: Vec::new(),
        }
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut out = vec![0u8; Self::HEADER_SIZE];
        LittleEndian::write_u32(&mut out[0..4], self.address);
        out[4] = self.length;
        out.extend_from_slice(&self.data);
        out
    }

    pub fn unpack(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < Self::HEADER_SIZE {
            return Err(ProtocolError::InvalidResponse(format!(
                "flash block header needs {} bytes, got {}",
                Self::HEADER_SIZE,
                data.len()
            )));
        }
        Ok(Self {
            address: LittleEndian::read_u32(&data[0..4]),
            length: data[4],
            data: data[Self::HEADER_SIZE..].to_vec(),
        })
    }
}

/// Body of a `DeviceError` frame: the command that failed and why
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceErrorRecord {
    pub failed_command: u8,
    pub code: u8,
}

impl DeviceErrorRecord {
    pub fn unpack(data: &[u8]) -> Result<Self, ProtocolError> {
        match data {
            [failed_command, code, ..] => Ok(Self {
                failed_command: *failed_command,
                code: *code,
            }),
            _ => Err(ProtocolError::InvalidResponse(
                "device error frame too short".into(),
            )),
        }
    }

    pub fn pack(&self) -> Vec<u8> {
        vec![self.failed_command, self.code]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_field_offsets() {
        let record = StatusRecord {
            battery_mv: 0x1234,
            pico_amps_x10: -5,
            raw_ppm_x10: 1005,
            flags: FLAG_PRIMARY_PUMP | FLAG_MAX_RANGE,
            averaging_depth: 50,
            ..Default::default()
        };
        let bytes = record.pack();
        assert_eq!(bytes.len(), StatusRecord::SIZE);
        assert_eq!(&bytes[0..2], &[0x34, 0x12]);
        assert_eq!(&bytes[2..6], &(-5i32).to_le_bytes());
        assert_eq!(bytes[20], FLAG_PRIMARY_PUMP | FLAG_MAX_RANGE);
        assert_eq!(StatusRecord::unpack(&bytes).unwrap(), record);
    }

    #[test]
    fn test_status_to_engineering_units() {
        let record = StatusRecord {
            battery_mv: 7400,
            pico_amps_x10: 1234,
            thermocouple_x10: 1015,
            pump_power_x10: 455,
            raw_ppm_x10: 1005,
            flags: FLAG_PRIMARY_SOLENOID | FLAG_PRIMARY_PUMP,
            ..Default::default()
        };
        let sample = record.to_raw_sample();
        assert!((sample.battery_volts - 7.4).abs() < 1e-9);
        assert!((sample.pico_amps - 123.4).abs() < 1e-9);
        assert!((sample.thermocouple_c - 101.5).abs() < 1e-9);
        assert!((sample.raw_ppm - 100.5).abs() < 1e-9);
        assert!(sample.primary_solenoid && sample.primary_pump);
        assert!(!sample.glow_plug);
        assert_eq!(sample.range, Range::Low);
    }

    #[test]
    fn test_short_status_rejected() {
        assert!(StatusRecord::unpack(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_calibration_slot_conversion() {
        let record = CalibrationRecord {
            index: 2,
            flags: 0x03,
            ppm_x10: 5000,
            fid_current_x10: 15000,
            h2_psi_x10: 1800,
            timestamp: 1_700_000_000,
        };
        let back = CalibrationRecord::unpack(&record.pack()).unwrap();
        let slot = back.to_slot();
        assert_eq!(slot.index, 2);
        assert!(slot.is_valid && slot.is_factory);
        assert!((slot.ppm - 500.0).abs() < 1e-9);
        assert_eq!(slot.timestamp.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_flash_block_layout() {
        let block = FlashBlock {
            address: 0x0001_0200,
            length: 3,
            data: vec![0xAA, 0xBB, 0xCC],
        };
        let bytes = block.pack();
        assert_eq!(&bytes[..5], &[0x00, 0x02, 0x01, 0x00, 3]);
        assert_eq!(FlashBlock::unpack(&bytes).unwrap(), block);
    }
}
