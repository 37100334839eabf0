//! Gen1 analyzer over the binary protocol

use std::time::{Duration, Instant};

use super::poller::{LogTarget, PollerSlot};
use super::{CalibrationResult, CalibrationSlot, PushedSamples, ReportingState, TelemetrySource};
use crate::config::SessionConfig;
use crate::protocol::binary::{
    build, BinaryProtocol, CalibrationRecord, Command, FlashBlock, IncomingFrame, OutgoingFrame,
    StatusRecord,
};
use crate::protocol::{CommunicationChannel, ProtocolError};
use crate::session::{Correlator, Session};
use crate::telemetry::{ControlAction, Range, RawSample};
use crate::transfer::{FirmwareUpdater, FlashAccess, FlashTransfer, UpdateReport};

/// Calibration slots on a Gen1 device
pub const GEN1_CALIBRATION_SLOTS: u8 = 6;

/// Bytes per flash chunk; keeps a write frame under the length limit
pub const GEN1_FLASH_CHUNK: usize = 192;

/// Commands that can be re-sent after a timeout without side effects
fn resend_safe(command: Command) -> bool {
    matches!(
        command,
        Command::AreYouThere
            | Command::ReadVersion
            | Command::ReadStatus
            | Command::ReadCalibration
            | Command::SetRange
            | Command::SetSamplingParameters
            | Command::SetPeriodicReporting
            | Command::PumpControl
            | Command::ClearCalibration
    )
}

fn exchange(
    correlator: &Correlator<BinaryProtocol>,
    frame: OutgoingFrame,
    attempts: u32,
) -> Result<IncomingFrame, ProtocolError> {
    let command = Command::from_id(frame.command_id).ok_or_else(|| {
        ProtocolError::InvalidRequest(format!("unknown command id {:#04x}", frame.command_id))
    })?;
    let attempts = if resend_safe(command) { attempts } else { 1 };
    correlator.send_and_wait_retrying(
        frame,
        command.id(),
        Duration::from_millis(command.timeout_ms()),
        attempts,
    )
}

fn read_status(
    correlator: &Correlator<BinaryProtocol>,
    attempts: u32,
) -> Result<RawSample, ProtocolError> {
    let reply = exchange(correlator, Command::ReadStatus.frame(), attempts)?;
    Ok(StatusRecord::unpack(&reply.payload)?.to_raw_sample())
}

fn apply_action(
    correlator: &Correlator<BinaryProtocol>,
    action: ControlAction,
    attempts: u32,
) -> Result<(), ProtocolError> {
    let frame = match action {
        ControlAction::SwitchRange(range) => build::set_range(range),
        ControlAction::SetAveragingDepth(depth) => build::set_averaging_depth(depth),
    };
    exchange(correlator, frame, attempts).map(|_| ())
}

/// Status for the telemetry poller, polled or pushed by the device
struct Gen1Telemetry {
    correlator: Correlator<BinaryProtocol>,
    attempts: u32,
    pushed: Option<PushedSamples<BinaryProtocol>>,
}

impl TelemetrySource for Gen1Telemetry {
    fn read_raw_sample(&mut self) -> Result<RawSample, ProtocolError> {
        match self.pushed.as_mut() {
            Some(pushed) => {
                let frame = pushed.next()?;
                Ok(StatusRecord::unpack(&frame.payload)?.to_raw_sample())
            }
            None => read_status(&self.correlator, self.attempts),
        }
    }

    fn apply(&mut self, action: ControlAction) -> Result<(), ProtocolError> {
        apply_action(&self.correlator, action, self.attempts)
    }
}

/// A connected Gen1 analyzer
pub struct Gen1Analyzer {
    session: Session<BinaryProtocol>,
    correlator: Correlator<BinaryProtocol>,
    telemetry: PollerSlot,
    reporting: ReportingState,
}

impl Gen1Analyzer {
    pub fn connect(
        channel: Box<dyn CommunicationChannel>,
        config: SessionConfig,
    ) -> Result<Self, ProtocolError> {
        let session = Session::connect(BinaryProtocol::new(), channel, config)?;
        Ok(Self::from_session(session))
    }

    pub fn from_session(session: Session<BinaryProtocol>) -> Self {
        let correlator = session.correlator();
        Self {
            session,
            correlator,
            telemetry: PollerSlot::default(),
            reporting: ReportingState::default(),
        }
    }

    pub fn session(&self) -> &Session<BinaryProtocol> {
        &self.session
    }

    fn attempts(&self) -> u32 {
        self.session.config().correlator.attempts
    }

    fn request(&self, frame: OutgoingFrame) -> Result<IncomingFrame, ProtocolError> {
        exchange(&self.correlator, frame, self.attempts())
    }

    /// Liveness probe; returns the round trip time
    pub fn ping(&self) -> Result<Duration, ProtocolError> {
        let start = Instant::now();
        self.request(Command::AreYouThere.frame())?;
        Ok(start.elapsed())
    }

    pub fn read_version(&self) -> Result<String, ProtocolError> {
        let reply = self.request(Command::ReadVersion.frame())?;
        Ok(String::from_utf8_lossy(&reply.payload)
            .trim_end_matches('\0')
            .trim()
            .to_string())
    }

    pub fn read_status(&self) -> Result<RawSample, ProtocolError> {
        read_status(&self.correlator, self.attempts())
    }

    pub fn set_range(&self, range: Range) -> Result<(), ProtocolError> {
        apply_action(&self.correlator, ControlAction::SwitchRange(range), self.attempts())
    }

    pub fn set_averaging_depth(&self, depth: u8) -> Result<(), ProtocolError> {
        apply_action(
            &self.correlator,
            ControlAction::SetAveragingDepth(depth),
            self.attempts(),
        )
    }

    /// Turn unsolicited status frames on or off. The period is sent in
    /// tenths of a second.
    pub fn set_periodic_reporting(&self, enabled: bool, period: Duration) -> Result<(), ProtocolError> {
        let period_ds = (period.as_millis() / 100).clamp(1, u8::MAX as u128) as u8;
        self.request(build::set_periodic_reporting(enabled, period_ds))?;
        self.reporting
            .set(enabled.then(|| Duration::from_millis(period_ds as u64 * 100)));
        Ok(())
    }

    /// Period of the unsolicited status frames, if they are on
    pub fn periodic_reporting(&self) -> Option<Duration> {
        self.reporting.get()
    }

    pub fn pump(&self, on: bool) -> Result<(), ProtocolError> {
        self.request(build::pump(on)).map(|_| ())
    }

    /// Start the ignition sequence with the glow plug on for `glow`
    pub fn ignite(&self, glow: Duration) -> Result<(), ProtocolError> {
        let glow_ms = glow.as_millis().min(u16::MAX as u128) as u16;
        self.request(build::ignite(glow_ms)).map(|_| ())
    }

    fn check_slot(index: u8) -> Result<(), ProtocolError> {
        if index >= GEN1_CALIBRATION_SLOTS {
            return Err(ProtocolError::InvalidRequest(format!(
                "calibration slot {index} out of range (0..{GEN1_CALIBRATION_SLOTS})"
            )));
        }
        Ok(())
    }

    pub fn read_calibration(&self, index: u8) -> Result<CalibrationSlot, ProtocolError> {
        Self::check_slot(index)?;
        let reply = self.request(build::read_calibration(index))?;
        Ok(CalibrationRecord::unpack(&reply.payload)?.to_slot())
    }

    /// Every slot, valid or not
    pub fn calibration_slots(&self) -> Result<Vec<CalibrationSlot>, ProtocolError> {
        (0..GEN1_CALIBRATION_SLOTS)
            .map(|index| self.read_calibration(index))
            .collect()
    }

    /// Calibrate slot `index` against a reference gas of `ppm`. When
    /// telemetry is running, the composite ppm seen while the device works
    /// is reported alongside the stored slot.
    pub fn generate_calibration(&self, index: u8, ppm: f64) -> Result<CalibrationResult, ProtocolError> {
        Self::check_slot(index)?;
        if !(0.0..=u32::MAX as f64 / 10.0).contains(&ppm) {
            return Err(ProtocolError::InvalidRequest(format!("reference ppm {ppm} out of range")));
        }
        self.telemetry.with(|poller| {
            if let Some(poller) = poller {
                poller.begin_calibration_capture();
            }
        });
        let reply = self.request(build::generate_calibration(index, (ppm * 10.0).round() as u32));
        let observed_ppm = self
            .telemetry
            .with(|poller| poller.and_then(|p| p.end_calibration_capture()));
        let slot = CalibrationRecord::unpack(&reply?.payload)?.to_slot();
        tracing::info!(session = %self.session.id(), slot = index, ppm, "calibration stored");
        Ok(CalibrationResult { slot, observed_ppm })
    }

    pub fn clear_calibration(&self, index: u8) -> Result<(), ProtocolError> {
        Self::check_slot(index)?;
        self.request(build::clear_calibration(index)).map(|_| ())
    }

    /// Chunked flash transfer publishing progress on the session's events
    pub fn flash(&self) -> FlashTransfer<'_, Self> {
        FlashTransfer::new(self, self.session.config().flash.clone())
            .with_events(self.session.events().clone())
    }

    /// Replace the firmware. Telemetry is paused and periodic reporting
    /// turned off for the duration; both come back afterwards, whether the
    /// update worked or not.
    pub fn update_firmware(&self, image: &[u8], password: u32) -> Result<UpdateReport, ProtocolError> {
        let reporting = self.periodic_reporting();
        if let Err(e) = self.set_periodic_reporting(false, Duration::ZERO) {
            tracing::warn!(session = %self.session.id(), "could not stop periodic reporting: {e}");
        }
        let config = self.session.config().firmware.clone();
        let result = self.telemetry.with(|poller| {
            FirmwareUpdater::new(&self.session, config)
                .pausing(poller)
                .run(build::enter_update_mode(password), image)
        });
        if let Some(period) = reporting {
            if let Err(e) = self.set_periodic_reporting(true, period) {
                tracing::warn!(session = %self.session.id(), "could not restore periodic reporting: {e}");
            }
        }
        result
    }

    /// Start feeding status into the telemetry pipeline. With
    /// `telemetry.periodic_reporting` set the device pushes status frames
    /// every polling interval; otherwise each one is read.
    pub fn start_telemetry(&self, log: Option<LogTarget>) -> Result<(), ProtocolError> {
        let config = self.session.config().telemetry.clone();
        let pushed = if config.periodic_reporting {
            self.set_periodic_reporting(true, config.polling_interval())?;
            Some(PushedSamples::new(
                self.correlator.clone(),
                Command::ReadStatus.id(),
                config.pushed_sample_wait(),
            ))
        } else {
            None
        };
        let source = Gen1Telemetry {
            correlator: self.correlator.clone(),
            attempts: 1,
            pushed,
        };
        self.telemetry.start(
            Box::new(source),
            config,
            self.session.events().clone(),
            log,
        )?;
        Ok(())
    }

    pub fn stop_telemetry(&self) {
        self.telemetry.stop();
        if self.session.config().telemetry.periodic_reporting && self.periodic_reporting().is_some() {
            if let Err(e) = self.set_periodic_reporting(false, Duration::ZERO) {
                tracing::warn!(session = %self.session.id(), "could not stop periodic reporting: {e}");
            }
        }
    }

    pub fn telemetry_running(&self) -> bool {
        self.telemetry.is_running()
    }

    /// Stop telemetry, flushing its log, then close the session
    pub fn shutdown(&self) {
        self.telemetry.stop();
        self.session.shutdown();
    }
}

impl Drop for Gen1Analyzer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl FlashAccess for Gen1Analyzer {
    fn chunk_size(&self) -> usize {
        GEN1_FLASH_CHUNK
    }

    fn write_chunk(&self, address: u32, data: &[u8]) -> Result<(), ProtocolError> {
        if data.len() > GEN1_FLASH_CHUNK {
            return Err(ProtocolError::InvalidRequest(format!(
                "flash chunk of {} bytes exceeds {GEN1_FLASH_CHUNK}",
                data.len()
            )));
        }
        let reply = self.correlator.send_and_wait(
            build::write_flash(address, data),
            Command::WriteFlash.id(),
            self.session.config().flash.chunk_timeout(),
        )?;
        let ack = FlashBlock::unpack(&reply.payload)?;
        if ack.address != address || ack.length as usize != data.len() {
            return Err(ProtocolError::InvalidResponse(format!(
                "write acknowledged {} bytes at {:#010x}, sent {} at {address:#010x}",
                ack.length,
                ack.address,
                data.len()
            )));
        }
        Ok(())
    }

    fn read_chunk(&self, address: u32, length: usize) -> Result<Vec<u8>, ProtocolError> {
        if length > GEN1_FLASH_CHUNK {
            return Err(ProtocolError::InvalidRequest(format!(
                "flash chunk of {length} bytes exceeds {GEN1_FLASH_CHUNK}"
            )));
        }
        let reply = self.correlator.send_and_wait(
            build::read_flash(address, length as u8),
            Command::ReadFlash.id(),
            self.session.config().flash.chunk_timeout(),
        )?;
        let block = FlashBlock::unpack(&reply.payload)?;
        if block.address != address {
            return Err(ProtocolError::InvalidResponse(format!(
                "asked for {address:#010x}, device answered {:#010x}",
                block.address
            )));
        }
        Ok(block.data)
    }
}
