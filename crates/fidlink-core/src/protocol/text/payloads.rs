//! Typed views of Gen2 message parameters
//!
//! | type | parameters |
//! |------|------------|
//! | RDNG | `PPM PA TC IT BATV H2HP H2LP SMPL PMPW PMPC SOLA SOLB PMPA PMPB GLOW RNG AVG` |
//! | BATS | `V PCT CHG` |
//! | DRVL | `PMPA PMPB GLOW SOLA SOLB` (percent) |
//! | CALT, CALG | `idx ppm pa h2 valid fac ts` |
//! | ERRR | `type code` |
//! | SHUT | `reason` |
//! | FLRD | `addr len`, data as unparsed hex |
//! | FLWR | `addr len data` |
//! | VERS | `hw fw` |
//! | RNGE | `rng` (0 low, 1 max) |
//! | AVGS | `depth` |
//! | PRDC | `on ms` |
//! | PUMP | `on` |
//! | IGNT | `glow` (ms) |
//! | CALD | `idx` |
//! | UPDM | `pw` |
//! | LOGR | hex as unparsed, closed by `LOGR END` |
//!
//! Requests carry the same keys as their replies; `CALT` and `CALD`
//! requests carry only `idx`, `CALG` requests `idx ppm`.

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::message::{MessageType, TextMessage};
use crate::device::CalibrationSlot;
use crate::protocol::ProtocolError;
use crate::telemetry::{Range, RawSample};

fn optional_f64(msg: &TextMessage, key: &str) -> Result<f64, ProtocolError> {
    match msg.get(key) {
        Some(_) => msg.get_f64(key),
        None => Ok(0.0),
    }
}

fn optional_bool(msg: &TextMessage, key: &str) -> Result<bool, ProtocolError> {
    match msg.get(key) {
        Some(_) => msg.get_bool(key),
        None => Ok(false),
    }
}

fn expect_type(msg: &TextMessage, expected: MessageType) -> Result<(), ProtocolError> {
    if msg.msg_type == expected {
        Ok(())
    } else {
        Err(ProtocolError::InvalidResponse(format!(
            "expected {expected}, got {}",
            msg.msg_type
        )))
    }
}

/// Sensor readings from an `RDNG` message
pub fn readings(msg: &TextMessage) -> Result<RawSample, ProtocolError> {
    expect_type(msg, MessageType::Rdng)?;
    Ok(RawSample {
        raw_ppm: msg.get_f64("PPM")?,
        pico_amps: msg.get_f64("PA")?,
        thermocouple_c: msg.get_f64("TC")?,
        battery_volts: msg.get_f64("BATV")?,
        pump_power_pct: msg.get_f64("PMPW")?,
        internal_temp_c: optional_f64(msg, "IT")?,
        h2_tank_psi: optional_f64(msg, "H2HP")?,
        h2_low_psi: optional_f64(msg, "H2LP")?,
        sample_psia: optional_f64(msg, "SMPL")?,
        pump_current_ma: optional_f64(msg, "PMPC")?,
        primary_solenoid: optional_bool(msg, "SOLA")?,
        secondary_solenoid: optional_bool(msg, "SOLB")?,
        primary_pump: optional_bool(msg, "PMPA")?,
        secondary_pump: optional_bool(msg, "PMPB")?,
        glow_plug: optional_bool(msg, "GLOW")?,
        range: Range::from_wire(optional_f64(msg, "RNG")? as u8),
        hardware_averaging: optional_f64(msg, "AVG")? as u8,
    })
}

/// Encode readings the way the instrument reports them
pub fn readings_message(sample: &RawSample) -> TextMessage {
    let flag = |b: bool| b as u8;
    TextMessage::new(MessageType::Rdng)
        .param("PPM", format!("{:.1}", sample.raw_ppm))
        .param("PA", format!("{:.1}", sample.pico_amps))
        .param("TC", format!("{:.1}", sample.thermocouple_c))
        .param("IT", format!("{:.1}", sample.internal_temp_c))
        .param("BATV", format!("{:.2}", sample.battery_volts))
        .param("H2HP", format!("{:.1}", sample.h2_tank_psi))
        .param("H2LP", format!("{:.1}", sample.h2_low_psi))
        .param("SMPL", format!("{:.2}", sample.sample_psia))
        .param("PMPW", format!("{:.1}", sample.pump_power_pct))
        .param("PMPC", format!("{:.0}", sample.pump_current_ma))
        .param("SOLA", flag(sample.primary_solenoid))
        .param("SOLB", flag(sample.secondary_solenoid))
        .param("PMPA", flag(sample.primary_pump))
        .param("PMPB", flag(sample.secondary_pump))
        .param("GLOW", flag(sample.glow_plug))
        .param("RNG", sample.range.wire_value())
        .param("AVG", sample.hardware_averaging)
}

/// Battery state from a `BATS` message
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryStatus {
    pub volts: f64,
    pub percent: f64,
    pub charging: bool,
}

impl BatteryStatus {
    pub fn from_message(msg: &TextMessage) -> Result<Self, ProtocolError> {
        expect_type(msg, MessageType::Bats)?;
        Ok(Self {
            volts: msg.get_f64("V")?,
            percent: optional_f64(msg, "PCT")?,
            charging: optional_bool(msg, "CHG")?,
        })
    }
}

/// Actuator drive levels from a `DRVL` message, in percent
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DriveLevels {
    pub primary_pump: f64,
    pub secondary_pump: f64,
    pub glow_plug: f64,
    pub primary_solenoid: f64,
    pub secondary_solenoid: f64,
}

impl DriveLevels {
    pub fn from_message(msg: &TextMessage) -> Result<Self, ProtocolError> {
        expect_type(msg, MessageType::Drvl)?;
        Ok(Self {
            primary_pump: optional_f64(msg, "PMPA")?,
            secondary_pump: optional_f64(msg, "PMPB")?,
            glow_plug: optional_f64(msg, "GLOW")?,
            primary_solenoid: optional_f64(msg, "SOLA")?,
            secondary_solenoid: optional_f64(msg, "SOLB")?,
        })
    }
}

/// Calibration slot from a `CALT` or `CALG` message
pub fn calibration_slot(msg: &TextMessage) -> Result<CalibrationSlot, ProtocolError> {
    if !matches!(msg.msg_type, MessageType::Calt | MessageType::Calg) {
        return Err(ProtocolError::InvalidResponse(format!(
            "expected calibration entry, got {}",
            msg.msg_type
        )));
    }
    let timestamp = match msg.get("ts") {
        Some(_) => Utc.timestamp_opt(msg.get_i64("ts")?, 0).single(),
        None => None,
    };
    Ok(CalibrationSlot {
        index: msg.get_i64("idx")? as u8,
        ppm: optional_f64(msg, "ppm")?,
        fid_current: optional_f64(msg, "pa")?,
        h2_pressure: optional_f64(msg, "h2")?,
        is_valid: optional_bool(msg, "valid")?,
        timestamp,
        is_factory: optional_bool(msg, "fac")?,
    })
}

/// Encode a calibration slot as a `CALT`/`CALG` reply
pub fn calibration_message(msg_type: MessageType, slot: &CalibrationSlot) -> TextMessage {
    let mut msg = TextMessage::new(msg_type)
        .param("idx", slot.index)
        .param("ppm", slot.ppm)
        .param("pa", slot.fid_current)
        .param("h2", slot.h2_pressure)
        .param("valid", slot.is_valid as u8)
        .param("fac", slot.is_factory as u8);
    if let Some(ts) = slot.timestamp {
        msg = msg.param("ts", ts.timestamp());
    }
    msg
}

/// `(type, code)` of an `ERRR` message
pub fn error_report(msg: &TextMessage) -> Result<(String, i32), ProtocolError> {
    expect_type(msg, MessageType::Errr)?;
    let error_type = msg.get("type").unwrap_or("").to_string();
    Ok((error_type, msg.get_i64("code")? as i32))
}

/// Data carried by an `FLRD` reply
pub fn flash_read_data(msg: &TextMessage) -> Result<(u32, Vec<u8>), ProtocolError> {
    expect_type(msg, MessageType::Flrd)?;
    let address = msg.get_i64("addr")? as u32;
    let data = hex::decode(msg.unparsed.trim())
        .map_err(|e| ProtocolError::InvalidResponse(format!("bad flash hex: {e}")))?;
    Ok((address, data))
}

pub fn flash_read_request(address: u32, length: usize) -> TextMessage {
    TextMessage::new(MessageType::Flrd)
        .param("addr", address)
        .param("len", length)
}

pub fn flash_write_request(address: u32, data: &[u8]) -> TextMessage {
    TextMessage::new(MessageType::Flwr)
        .param("addr", address)
        .param("len", data.len())
        .param("data", hex::encode(data))
}

pub fn range_request(range: Range) -> TextMessage {
    TextMessage::new(MessageType::Rnge).param("rng", range.wire_value())
}

pub fn averaging_request(depth: u8) -> TextMessage {
    TextMessage::new(MessageType::Avgs).param("depth", depth)
}

pub fn periodic_request(enabled: bool, period_ms: u64) -> TextMessage {
    TextMessage::new(MessageType::Prdc)
        .param("on", enabled as u8)
        .param("ms", period_ms)
}

pub fn pump_request(on: bool) -> TextMessage {
    TextMessage::new(MessageType::Pump).param("on", on as u8)
}

pub fn ignite_request(glow_ms: u64) -> TextMessage {
    TextMessage::new(MessageType::Ignt).param("glow", glow_ms)
}

/// `CALT` or `CALD` for one slot
pub fn slot_request(msg_type: MessageType, index: u8) -> TextMessage {
    TextMessage::new(msg_type).param("idx", index)
}

pub fn generate_calibration_request(index: u8, ppm: f64) -> TextMessage {
    TextMessage::new(MessageType::Calg)
        .param("idx", index)
        .param("ppm", ppm)
}

pub fn update_mode_request(password: u32) -> TextMessage {
    TextMessage::new(MessageType::Updm).param("pw", password)
}

/// Bytes carried by one `LOGR` line
pub fn log_chunk(msg: &TextMessage) -> Result<Vec<u8>, ProtocolError> {
    expect_type(msg, MessageType::Logr)?;
    hex::decode(msg.unparsed.trim())
        .map_err(|e| ProtocolError::InvalidResponse(format!("bad log hex: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::text::parse_line;

    #[test]
    fn test_readings_roundtrip_through_line() {
        let sample = RawSample {
            raw_ppm: 12.5,
            pico_amps: 103.2,
            thermocouple_c: 88.0,
            battery_volts: 7.25,
            pump_power_pct: 45.0,
            primary_pump: true,
            range: Range::Max,
            hardware_averaging: 10,
            ..Default::default()
        };
        let line = readings_message(&sample).encode("ZUzu");
        let parsed = parse_line(line.trim_end()).unwrap();
        assert_eq!(readings(&parsed).unwrap(), sample);
    }

    #[test]
    fn test_readings_missing_required_field() {
        let msg = parse_line("ZUzu RDNG PPM=1.0,PA=2.0").unwrap();
        assert!(readings(&msg).is_err());
    }

    #[test]
    fn test_error_report() {
        let msg = parse_line("ZUzu ERRR type=CALG,code=4").unwrap();
        assert_eq!(error_report(&msg).unwrap(), ("CALG".to_string(), 4));
    }

    #[test]
    fn test_flash_read_payload() {
        let msg = parse_line("ZUzu FLRD addr=256,len=3 0a0BfF").unwrap();
        assert_eq!(flash_read_data(&msg).unwrap(), (256, vec![0x0A, 0x0B, 0xFF]));
    }

    #[test]
    fn test_calibration_slot() {
        let msg = parse_line("ZUzu CALT idx=2,ppm=500,pa=1500.5,h2=18,valid=1,fac=0,ts=1700000000")
            .unwrap();
        let slot = calibration_slot(&msg).unwrap();
        assert_eq!(slot.index, 2);
        assert!(slot.is_valid && !slot.is_factory);
        assert_eq!(slot.timestamp.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_log_chunk() {
        let msg = parse_line("ZUzu LOGR 68690a").unwrap();
        assert_eq!(log_chunk(&msg).unwrap(), b"hi\n".to_vec());
        let bad = parse_line("ZUzu LOGR zz").unwrap();
        assert!(log_chunk(&bad).is_err());
    }

    #[test]
    fn test_request_builders() {
        let line = generate_calibration_request(3, 500.0).encode("ZUzu");
        assert_eq!(line, "ZUzu CALG idx=3,ppm=500 \r\n");
        assert_eq!(range_request(Range::Max).get("rng"), Some("1"));
    }

    #[test]
    fn test_battery_status() {
        let msg = parse_line("ZUzu BATS V=7.4,PCT=81,CHG=1").unwrap();
        let status = BatteryStatus::from_message(&msg).unwrap();
        assert!(status.charging);
        assert_eq!(status.percent, 81.0);
    }
}
