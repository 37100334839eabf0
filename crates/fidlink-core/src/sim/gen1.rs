//! Simulated Gen1 analyzer

use byteorder::{ByteOrder, LittleEndian};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use super::{Bootloader, SimDevice, SIM_FLASH_SIZE, SIM_PASSWORD};
use crate::device::gen1::GEN1_CALIBRATION_SLOTS;
use crate::protocol::Decoded;
use crate::protocol::binary::{
    CalibrationRecord, Command, DeviceErrorRecord, FlashBlock, FrameDecoder, IncomingFrame,
    OutgoingFrame, StatusRecord, FLAG_GLOW_PLUG, FLAG_MAX_RANGE, FLAG_PRIMARY_PUMP,
    FLAG_PRIMARY_SOLENOID,
};

/// A lit, idling instrument reading about 10 ppm
pub fn idle_status() -> StatusRecord {
    StatusRecord {
        battery_mv: 7400,
        pico_amps_x10: 420,
        thermocouple_x10: 1250,
        internal_temp_x10: 310,
        h2_tank_psi_x10: 18_000,
        h2_low_psi_x10: 180,
        sample_psia_x100: 1470,
        pump_power_x10: 450,
        pump_current_ma: 120,
        flags: FLAG_PRIMARY_SOLENOID | FLAG_PRIMARY_PUMP,
        averaging_depth: 50,
        raw_ppm_x10: 100,
    }
}

fn frame(command_id: u8, payload: Vec<u8>) -> Vec<u8> {
    OutgoingFrame::new(command_id, payload)
        .encode()
        .map(|encoded| encoded.to_vec())
        .unwrap_or_default()
}

fn error_frame(failed_command: u8, code: u8) -> Vec<u8> {
    let record = DeviceErrorRecord {
        failed_command,
        code,
    };
    frame(Command::DeviceError.id(), record.pack())
}

pub struct Gen1Sim {
    decoder: FrameDecoder,
    pub status: StatusRecord,
    script: VecDeque<StatusRecord>,
    noise: Option<StdRng>,
    pub calibration: Vec<CalibrationRecord>,
    pub flash: Vec<u8>,
    pub version: String,
    pub password: u32,
    failures: HashMap<u8, u8>,
    muted: HashSet<u8>,
    corrupt_writes: u32,
    periodic: Option<(Duration, Instant)>,
    /// Command ids in the order they arrived
    pub received: Vec<u8>,
    bootloader: Option<Bootloader>,
    reject_block_once: Option<usize>,
    /// Image accepted by the last completed firmware update
    pub installed_image: Option<Vec<u8>>,
}

impl Default for Gen1Sim {
    fn default() -> Self {
        Self::new()
    }
}

impl Gen1Sim {
    pub fn new() -> Self {
        Self {
            decoder: FrameDecoder::new(),
            status: idle_status(),
            script: VecDeque::new(),
            noise: None,
            calibration: (0..GEN1_CALIBRATION_SLOTS)
                .map(|index| CalibrationRecord {
                    index,
                    ..Default::default()
                })
                .collect(),
            flash: vec![0xFF; SIM_FLASH_SIZE],
            version: "FID1 v3.2.7".to_string(),
            password: SIM_PASSWORD,
            failures: HashMap::new(),
            muted: HashSet::new(),
            corrupt_writes: 0,
            periodic: None,
            received: Vec::new(),
            bootloader: None,
            reject_block_once: None,
            installed_image: None,
        }
    }

    /// Jitter readings around `status`
    pub fn with_noise(mut self, seed: u64) -> Self {
        self.noise = Some(StdRng::seed_from_u64(seed));
        self
    }

    /// Serve `record` for the next `ReadStatus`, ahead of the steady state
    pub fn push_status(&mut self, record: StatusRecord) {
        self.script.push_back(record);
    }

    /// Answer the next `command` with a device error
    pub fn fail_next(&mut self, command: Command, code: u8) {
        self.failures.insert(command.id(), code);
    }

    /// Ignore `command` entirely
    pub fn mute(&mut self, command: Command) {
        self.muted.insert(command.id());
    }

    pub fn unmute(&mut self, command: Command) {
        self.muted.remove(&command.id());
    }

    /// Store the next `count` flash writes with a flipped byte
    pub fn corrupt_next_writes(&mut self, count: u32) {
        self.corrupt_writes = count;
    }

    /// Answer the firmware block at `index` with a bad token once
    pub fn reject_block_once(&mut self, index: usize) {
        self.reject_block_once = Some(index);
    }

    pub fn count(&self, command: Command) -> usize {
        self.received.iter().filter(|id| **id == command.id()).count()
    }

    pub fn in_bootloader(&self) -> bool {
        self.bootloader.is_some()
    }

    fn next_status(&mut self) -> StatusRecord {
        if let Some(record) = self.script.pop_front() {
            return record;
        }
        let mut record = self.status;
        if let Some(rng) = self.noise.as_mut() {
            record.raw_ppm_x10 = (record.raw_ppm_x10 + rng.gen_range(-15..=15)).max(0);
            record.pico_amps_x10 += rng.gen_range(-30..=30);
            record.thermocouple_x10 += rng.gen_range(-5..=5);
        }
        record
    }

    fn set_flag(&mut self, mask: u8, on: bool) {
        if on {
            self.status.flags |= mask;
        } else {
            self.status.flags &= !mask;
        }
    }

    fn flash_range(&self, address: u32, length: usize) -> Option<std::ops::Range<usize>> {
        let start = address as usize;
        let end = start.checked_add(length)?;
        (end <= self.flash.len()).then_some(start..end)
    }

    fn handle(&mut self, request: IncomingFrame) -> Vec<u8> {
        let id = request.command_id;
        self.received.push(id);
        if self.muted.contains(&id) {
            return Vec::new();
        }
        if let Some(code) = self.failures.remove(&id) {
            return error_frame(id, code);
        }
        let Some(command) = Command::from_id(id) else {
            return error_frame(id, 1);
        };
        let body = request.payload;
        let first = body.first().copied();

        match command {
            Command::AreYouThere => frame(id, Vec::new()),
            Command::ReadVersion => frame(id, self.version.as_bytes().to_vec()),
            Command::PumpControl => {
                let Some(on) = first else {
                    return error_frame(id, 2);
                };
                self.set_flag(FLAG_PRIMARY_PUMP, on != 0);
                frame(id, vec![on])
            }
            Command::SetSamplingParameters => {
                let Some(depth) = first.filter(|d| *d > 0) else {
                    return error_frame(id, 2);
                };
                self.status.averaging_depth = depth;
                frame(id, vec![depth])
            }
            Command::SetRange => {
                let Some(range) = first else {
                    return error_frame(id, 2);
                };
                self.set_flag(FLAG_MAX_RANGE, range != 0);
                frame(id, vec![range])
            }
            Command::SetPeriodicReporting => {
                let (Some(&enabled), Some(&period_ds)) = (body.first(), body.get(1)) else {
                    return error_frame(id, 2);
                };
                self.periodic = (enabled != 0).then(|| {
                    (
                        Duration::from_millis(period_ds.max(1) as u64 * 100),
                        Instant::now(),
                    )
                });
                frame(id, body.clone())
            }
            Command::ReadFlash => {
                let Ok(block) = FlashBlock::unpack(&body) else {
                    return error_frame(id, 2);
                };
                let Some(range) = self.flash_range(block.address, block.length as usize) else {
                    return error_frame(id, 7);
                };
                let reply = FlashBlock {
                    address: block.address,
                    length: block.length,
                    data: self.flash[range].to_vec(),
                };
                frame(id, reply.pack())
            }
            Command::WriteFlash => {
                let Ok(block) = FlashBlock::unpack(&body) else {
                    return error_frame(id, 2);
                };
                if block.data.len() != block.length as usize {
                    return error_frame(id, 2);
                }
                let Some(range) = self.flash_range(block.address, block.data.len()) else {
                    return error_frame(id, 7);
                };
                let start = range.start;
                self.flash[range].copy_from_slice(&block.data);
                if self.corrupt_writes > 0 && !block.data.is_empty() {
                    self.corrupt_writes -= 1;
                    self.flash[start] ^= 0xA5;
                }
                frame(id, FlashBlock::request(block.address, block.length).pack())
            }
            Command::Ignite => {
                if self.status.flags & FLAG_PRIMARY_PUMP == 0 {
                    return error_frame(id, 5);
                }
                if self.status.thermocouple_x10 > 750 && self.status.flags & FLAG_PRIMARY_SOLENOID != 0 {
                    return error_frame(id, 6);
                }
                self.set_flag(FLAG_GLOW_PLUG, true);
                self.set_flag(FLAG_PRIMARY_SOLENOID, true);
                frame(id, body.clone())
            }
            Command::ReadStatus => {
                let record = self.next_status();
                frame(id, record.pack())
            }
            Command::ReadCalibration => match first.and_then(|i| self.calibration.get(i as usize)) {
                Some(record) => frame(id, record.pack()),
                None => error_frame(id, 2),
            },
            Command::GenerateCalibration => {
                if body.len() < 5 {
                    return error_frame(id, 2);
                }
                let index = body[0];
                if index as usize >= self.calibration.len() {
                    return error_frame(id, 3);
                }
                let record = CalibrationRecord {
                    index,
                    flags: 0x01,
                    ppm_x10: LittleEndian::read_u32(&body[1..5]),
                    fid_current_x10: self.status.pico_amps_x10,
                    h2_psi_x10: self.status.h2_tank_psi_x10,
                    timestamp: Utc::now().timestamp() as u32,
                };
                self.calibration[index as usize] = record;
                frame(id, record.pack())
            }
            Command::ClearCalibration => {
                let Some(index) = first.filter(|i| (*i as usize) < self.calibration.len()) else {
                    return error_frame(id, 2);
                };
                self.calibration[index as usize] = CalibrationRecord {
                    index,
                    ..Default::default()
                };
                frame(id, vec![index])
            }
            Command::EnterUpdateMode => {
                if body.len() < 4 || LittleEndian::read_u32(&body[..4]) != self.password {
                    return error_frame(id, 2);
                }
                self.periodic = None;
                self.bootloader = Some(Bootloader::new(self.reject_block_once.take()));
                Bootloader::ready()
            }
            Command::DeviceError => error_frame(id, 1),
        }
    }
}

impl SimDevice for Gen1Sim {
    fn receive(&mut self, bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, byte) in bytes.iter().enumerate() {
            if let Some(boot) = self.bootloader.as_mut() {
                out.extend(boot.receive(&bytes[i..]));
                if boot.finished {
                    self.installed_image = Some(std::mem::take(&mut boot.image));
                    self.bootloader = None;
                    self.decoder.reset();
                }
                break;
            }
            for decoded in self.decoder.push(*byte) {
                if let Decoded::Message(request) = decoded {
                    out.extend(self.handle(request));
                }
            }
        }
        out
    }

    fn tick(&mut self) -> Vec<u8> {
        let due = match self.periodic.as_mut() {
            Some((period, last)) if last.elapsed() >= *period => {
                *last = Instant::now();
                true
            }
            _ => false,
        };
        if !due {
            return Vec::new();
        }
        let record = self.next_status();
        frame(Command::ReadStatus.id(), record.pack())
    }
}
