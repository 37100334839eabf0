//! Simulated Gen2 analyzer

use chrono::{TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use super::{Bootloader, SimDevice, SIM_FLASH_SIZE, SIM_PASSWORD};
use crate::device::gen2::GEN2_CALIBRATION_SLOTS;
use crate::device::CalibrationSlot;
use crate::protocol::text::payloads::{self, BatteryStatus, DriveLevels};
use crate::protocol::text::{parse_line, MessageType, TextMessage, LOG_END_MARKER};
use crate::telemetry::{Range, RawSample};

/// Prefix on every line the simulated device sends
pub const DEVICE_PREFIX: &str = "FID2";

/// Log bytes per `LOGR` line
const LOG_LINE_BYTES: usize = 32;

/// A lit, idling instrument reading about 10 ppm
pub fn idle_readings() -> RawSample {
    RawSample {
        battery_volts: 7.4,
        pico_amps: 42.0,
        thermocouple_c: 125.0,
        internal_temp_c: 31.0,
        h2_tank_psi: 1800.0,
        h2_low_psi: 18.0,
        sample_psia: 14.7,
        pump_power_pct: 45.0,
        pump_current_ma: 120.0,
        raw_ppm: 10.0,
        primary_solenoid: true,
        primary_pump: true,
        hardware_averaging: 50,
        ..Default::default()
    }
}

/// Encode a device line
pub fn line(msg: &TextMessage) -> Vec<u8> {
    msg.encode(DEVICE_PREFIX).into_bytes()
}

fn error_line(failed: MessageType, code: i32) -> Vec<u8> {
    line(&TextMessage::new(MessageType::Errr)
        .param("type", failed)
        .param("code", code))
}

pub struct Gen2Sim {
    buffer: Vec<u8>,
    pub readings: RawSample,
    script: VecDeque<RawSample>,
    noise: Option<StdRng>,
    pub battery: BatteryStatus,
    pub drive: DriveLevels,
    pub calibration: Vec<CalibrationSlot>,
    pub flash: Vec<u8>,
    /// Contents served by `LOGR`
    pub device_log: Vec<u8>,
    /// Leave off the closing `LOGR END`
    pub omit_log_end: bool,
    pub version: String,
    pub password: u32,
    failures: HashMap<MessageType, i32>,
    muted: HashSet<MessageType>,
    delays: HashMap<MessageType, Duration>,
    deferred: Vec<(Instant, Vec<u8>)>,
    corrupt_writes: u32,
    periodic: Option<(Duration, Instant)>,
    pub received: Vec<MessageType>,
    bootloader: Option<Bootloader>,
    reject_block_once: Option<usize>,
    pub installed_image: Option<Vec<u8>>,
}

impl Default for Gen2Sim {
    fn default() -> Self {
        Self::new()
    }
}

impl Gen2Sim {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            readings: idle_readings(),
            script: VecDeque::new(),
            noise: None,
            battery: BatteryStatus {
                volts: 7.4,
                percent: 82.0,
                charging: false,
            },
            drive: DriveLevels {
                primary_pump: 45.0,
                primary_solenoid: 100.0,
                ..Default::default()
            },
            calibration: (0..GEN2_CALIBRATION_SLOTS)
                .map(|index| CalibrationSlot {
                    index,
                    ppm: 0.0,
                    fid_current: 0.0,
                    h2_pressure: 0.0,
                    is_valid: false,
                    timestamp: None,
                    is_factory: false,
                })
                .collect(),
            flash: vec![0xFF; SIM_FLASH_SIZE],
            device_log: Vec::new(),
            omit_log_end: false,
            version: "4.1.0".to_string(),
            password: SIM_PASSWORD,
            failures: HashMap::new(),
            muted: HashSet::new(),
            delays: HashMap::new(),
            deferred: Vec::new(),
            corrupt_writes: 0,
            periodic: None,
            received: Vec::new(),
            bootloader: None,
            reject_block_once: None,
            installed_image: None,
        }
    }

    pub fn with_noise(mut self, seed: u64) -> Self {
        self.noise = Some(StdRng::seed_from_u64(seed));
        self
    }

    pub fn push_readings(&mut self, sample: RawSample) {
        self.script.push_back(sample);
    }

    pub fn fail_next(&mut self, msg_type: MessageType, code: i32) {
        self.failures.insert(msg_type, code);
    }

    pub fn mute(&mut self, msg_type: MessageType) {
        self.muted.insert(msg_type);
    }

    pub fn unmute(&mut self, msg_type: MessageType) {
        self.muted.remove(&msg_type);
    }

    /// Hold the next reply of `msg_type` back for `delay`, as a device that
    /// takes a while to finish the job would
    pub fn delay_next(&mut self, msg_type: MessageType, delay: Duration) {
        self.delays.insert(msg_type, delay);
    }

    pub fn corrupt_next_writes(&mut self, count: u32) {
        self.corrupt_writes = count;
    }

    pub fn reject_block_once(&mut self, index: usize) {
        self.reject_block_once = Some(index);
    }

    pub fn count(&self, msg_type: MessageType) -> usize {
        self.received.iter().filter(|t| **t == msg_type).count()
    }

    pub fn in_bootloader(&self) -> bool {
        self.bootloader.is_some()
    }

    fn next_readings(&mut self) -> RawSample {
        if let Some(sample) = self.script.pop_front() {
            return sample;
        }
        let mut sample = self.readings;
        if let Some(rng) = self.noise.as_mut() {
            sample.raw_ppm = (sample.raw_ppm + rng.gen_range(-1.5..=1.5)).max(0.0);
            sample.pico_amps += rng.gen_range(-3.0..=3.0);
            sample.thermocouple_c += rng.gen_range(-0.5..=0.5);
        }
        sample
    }

    fn flash_range(&self, address: u32, length: usize) -> Option<std::ops::Range<usize>> {
        let start = address as usize;
        let end = start.checked_add(length)?;
        (end <= self.flash.len()).then_some(start..end)
    }

    fn slot_index(&self, request: &TextMessage) -> Option<usize> {
        request
            .get_i64("idx")
            .ok()
            .filter(|i| (0..self.calibration.len() as i64).contains(i))
            .map(|i| i as usize)
    }

    fn handle(&mut self, request: TextMessage) -> Vec<u8> {
        let kind = request.msg_type;
        self.received.push(kind);
        if self.muted.contains(&kind) {
            return Vec::new();
        }
        if let Some(code) = self.failures.remove(&kind) {
            return error_line(kind, code);
        }

        match kind {
            MessageType::Ping => line(&TextMessage::new(MessageType::Ping)),
            MessageType::Vers => line(
                &TextMessage::new(MessageType::Vers)
                    .param("hw", "G2")
                    .param("fw", &self.version),
            ),
            MessageType::Rdng => {
                let sample = self.next_readings();
                line(&payloads::readings_message(&sample))
            }
            MessageType::Bats => line(
                &TextMessage::new(MessageType::Bats)
                    .param("V", self.battery.volts)
                    .param("PCT", self.battery.percent)
                    .param("CHG", self.battery.charging as u8),
            ),
            MessageType::Drvl => line(
                &TextMessage::new(MessageType::Drvl)
                    .param("PMPA", self.drive.primary_pump)
                    .param("PMPB", self.drive.secondary_pump)
                    .param("GLOW", self.drive.glow_plug)
                    .param("SOLA", self.drive.primary_solenoid)
                    .param("SOLB", self.drive.secondary_solenoid),
            ),
            MessageType::Rnge => match request.get_i64("rng") {
                Ok(rng) => {
                    self.readings.range = Range::from_wire(rng as u8);
                    line(&payloads::range_request(self.readings.range))
                }
                Err(_) => error_line(kind, 2),
            },
            MessageType::Avgs => match request.get_i64("depth") {
                Ok(depth) if (1..=255).contains(&depth) => {
                    self.readings.hardware_averaging = depth as u8;
                    line(&payloads::averaging_request(depth as u8))
                }
                _ => error_line(kind, 2),
            },
            MessageType::Prdc => {
                let (Ok(on), Ok(ms)) = (request.get_bool("on"), request.get_i64("ms")) else {
                    return error_line(kind, 2);
                };
                self.periodic = on.then(|| (Duration::from_millis(ms.max(100) as u64), Instant::now()));
                line(&payloads::periodic_request(on, ms.max(0) as u64))
            }
            MessageType::Pump => match request.get_bool("on") {
                Ok(on) => {
                    self.readings.primary_pump = on;
                    self.drive.primary_pump = if on { 45.0 } else { 0.0 };
                    line(&payloads::pump_request(on))
                }
                Err(_) => error_line(kind, 2),
            },
            MessageType::Ignt => {
                if !self.readings.primary_pump {
                    return error_line(kind, 5);
                }
                if self.readings.thermocouple_c > 75.0 && self.readings.primary_solenoid {
                    return error_line(kind, 6);
                }
                self.readings.glow_plug = true;
                self.readings.primary_solenoid = true;
                line(&TextMessage::new(MessageType::Ignt).param("glow", request.get("glow").unwrap_or("0")))
            }
            MessageType::Calt => match self.slot_index(&request) {
                Some(index) => line(&payloads::calibration_message(
                    MessageType::Calt,
                    &self.calibration[index],
                )),
                None => error_line(kind, 2),
            },
            MessageType::Calg => {
                let Some(index) = self.slot_index(&request) else {
                    return error_line(kind, 3);
                };
                let Ok(ppm) = request.get_f64("ppm") else {
                    return error_line(kind, 2);
                };
                let slot = CalibrationSlot {
                    index: index as u8,
                    ppm,
                    fid_current: self.readings.pico_amps,
                    h2_pressure: self.readings.h2_tank_psi,
                    is_valid: true,
                    timestamp: Utc.timestamp_opt(Utc::now().timestamp(), 0).single(),
                    is_factory: false,
                };
                self.calibration[index] = slot.clone();
                line(&payloads::calibration_message(MessageType::Calg, &slot))
            }
            MessageType::Cald => match self.slot_index(&request) {
                Some(index) => {
                    let slot = &mut self.calibration[index];
                    slot.is_valid = false;
                    slot.ppm = 0.0;
                    slot.fid_current = 0.0;
                    slot.timestamp = None;
                    line(&payloads::slot_request(MessageType::Cald, index as u8))
                }
                None => error_line(kind, 2),
            },
            MessageType::Logr => {
                let mut out = Vec::new();
                for chunk in self.device_log.chunks(LOG_LINE_BYTES) {
                    out.extend(line(&TextMessage::new(MessageType::Logr).with_unparsed(hex::encode(chunk))));
                }
                if !self.omit_log_end {
                    out.extend(line(&TextMessage::new(MessageType::Logr).with_unparsed(LOG_END_MARKER)));
                }
                out
            }
            MessageType::Flrd => {
                let (Ok(address), Ok(length)) = (request.get_i64("addr"), request.get_i64("len")) else {
                    return error_line(kind, 2);
                };
                let Some(range) = self.flash_range(address as u32, length.max(0) as usize) else {
                    return error_line(kind, 7);
                };
                line(
                    &TextMessage::new(MessageType::Flrd)
                        .param("addr", address)
                        .param("len", length)
                        .with_unparsed(hex::encode(&self.flash[range])),
                )
            }
            MessageType::Flwr => {
                let Ok(address) = request.get_i64("addr") else {
                    return error_line(kind, 2);
                };
                let Ok(data) = hex::decode(request.get("data").unwrap_or("")) else {
                    return error_line(kind, 2);
                };
                let Some(range) = self.flash_range(address as u32, data.len()) else {
                    return error_line(kind, 7);
                };
                let start = range.start;
                self.flash[range].copy_from_slice(&data);
                if self.corrupt_writes > 0 && !data.is_empty() {
                    self.corrupt_writes -= 1;
                    self.flash[start] ^= 0xA5;
                }
                line(
                    &TextMessage::new(MessageType::Flwr)
                        .param("addr", address)
                        .param("len", data.len()),
                )
            }
            MessageType::Updm => {
                if request.get_i64("pw").ok() != Some(self.password as i64) {
                    return error_line(kind, 2);
                }
                self.periodic = None;
                self.bootloader = Some(Bootloader::new(self.reject_block_once.take()));
                Bootloader::ready()
            }
            MessageType::Fidr | MessageType::Errr | MessageType::Shut => error_line(kind, 1),
        }
    }
}

impl SimDevice for Gen2Sim {
    fn receive(&mut self, bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, byte) in bytes.iter().enumerate() {
            if let Some(boot) = self.bootloader.as_mut() {
                out.extend(boot.receive(&bytes[i..]));
                if boot.finished {
                    self.installed_image = Some(std::mem::take(&mut boot.image));
                    self.bootloader = None;
                    self.buffer.clear();
                }
                break;
            }
            self.buffer.push(*byte);
            if !self.buffer.ends_with(b"\r\n") {
                continue;
            }
            let raw = std::mem::take(&mut self.buffer);
            let text = String::from_utf8_lossy(&raw[..raw.len() - 2]).to_string();
            match parse_line(&text) {
                Ok(request) => {
                    let kind = request.msg_type;
                    let answer = self.handle(request);
                    match self.delays.remove(&kind) {
                        Some(delay) => self.deferred.push((Instant::now() + delay, answer)),
                        None => out.extend(answer),
                    }
                }
                Err(_) => tracing::trace!("simulator ignored '{text}'"),
            }
        }
        out
    }

    fn tick(&mut self) -> Vec<u8> {
        let now = Instant::now();
        let mut out = Vec::new();
        self.deferred.retain(|(at, answer)| {
            let due = *at <= now;
            if due {
                out.extend_from_slice(answer);
            }
            !due
        });

        let due = match self.periodic.as_mut() {
            Some((period, last)) if last.elapsed() >= *period => {
                *last = now;
                true
            }
            _ => false,
        };
        if due {
            let sample = self.next_readings();
            out.extend(line(&payloads::readings_message(&sample)));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ask(sim: &mut Gen2Sim, request: TextMessage) -> Vec<TextMessage> {
        let answer = sim.receive(request.encode("ZUzu").as_bytes());
        String::from_utf8(answer)
            .unwrap()
            .split("\r\n")
            .filter(|l| !l.is_empty())
            .map(|l| parse_line(l).unwrap())
            .collect()
    }

    #[test]
    fn test_flash_roundtrip() {
        let mut sim = Gen2Sim::new();
        let ack = ask(&mut sim, payloads::flash_write_request(100, &[9, 8, 7]));
        assert_eq!(ack[0].msg_type, MessageType::Flwr);
        let read = ask(&mut sim, payloads::flash_read_request(100, 3));
        assert_eq!(payloads::flash_read_data(&read[0]).unwrap(), (100, vec![9, 8, 7]));
    }

    #[test]
    fn test_log_lines_end_with_marker() {
        let mut sim = Gen2Sim::new();
        sim.device_log = (0..70u8).collect();
        let lines = ask(&mut sim, TextMessage::new(MessageType::Logr));
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[3].unparsed, LOG_END_MARKER);
    }

    #[test]
    fn test_calibration_needs_free_slot() {
        let mut sim = Gen2Sim::new();
        let reply = ask(&mut sim, payloads::generate_calibration_request(12, 500.0));
        assert_eq!(payloads::error_report(&reply[0]).unwrap(), ("CALG".to_string(), 3));
    }
}
