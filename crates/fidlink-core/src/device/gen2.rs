//! Gen2 analyzer over the text protocol

use std::time::{Duration, Instant};

use super::poller::{LogTarget, PollerSlot};
use super::{CalibrationResult, CalibrationSlot, PushedSamples, ReportingState, TelemetrySource};
use crate::config::SessionConfig;
use crate::protocol::text::payloads::{self, BatteryStatus, DriveLevels};
use crate::protocol::text::{MessageType, TextMessage, TextProtocol};
use crate::protocol::{CommunicationChannel, ProtocolError};
use crate::session::{Correlator, Session};
use crate::telemetry::{ControlAction, Range, RawSample};
use crate::transfer::{FirmwareUpdater, FlashAccess, FlashTransfer, UpdateReport};

/// Calibration slots on a Gen2 device
pub const GEN2_CALIBRATION_SLOTS: u8 = 10;

/// Bytes per flash chunk; 512 hex characters per line
pub const GEN2_FLASH_CHUNK: usize = 256;

/// How long a whole log dump may take
pub const LOG_RETRIEVAL_TIMEOUT: Duration = Duration::from_secs(30);

fn timeout_for(msg_type: MessageType) -> Duration {
    let ms = match msg_type {
        MessageType::Calg => 15_000,
        MessageType::Ignt => 5_000,
        MessageType::Flwr => 1_500,
        MessageType::Rdng | MessageType::Ping => 500,
        _ => 1_000,
    };
    Duration::from_millis(ms)
}

fn resend_safe(msg_type: MessageType) -> bool {
    !matches!(
        msg_type,
        MessageType::Calg | MessageType::Ignt | MessageType::Updm | MessageType::Logr
    )
}

fn exchange(
    correlator: &Correlator<TextProtocol>,
    request: TextMessage,
    attempts: u32,
) -> Result<TextMessage, ProtocolError> {
    let msg_type = request.msg_type;
    let attempts = if resend_safe(msg_type) { attempts } else { 1 };
    correlator.send_and_wait_retrying(request, msg_type, timeout_for(msg_type), attempts)
}

fn read_readings(
    correlator: &Correlator<TextProtocol>,
    attempts: u32,
) -> Result<RawSample, ProtocolError> {
    let reply = exchange(correlator, TextMessage::new(MessageType::Rdng), attempts)?;
    payloads::readings(&reply)
}

fn apply_action(
    correlator: &Correlator<TextProtocol>,
    action: ControlAction,
    attempts: u32,
) -> Result<(), ProtocolError> {
    let request = match action {
        ControlAction::SwitchRange(range) => payloads::range_request(range),
        ControlAction::SetAveragingDepth(depth) => payloads::averaging_request(depth),
    };
    exchange(correlator, request, attempts).map(|_| ())
}

struct Gen2Telemetry {
    correlator: Correlator<TextProtocol>,
    pushed: Option<PushedSamples<TextProtocol>>,
}

impl TelemetrySource for Gen2Telemetry {
    fn read_raw_sample(&mut self) -> Result<RawSample, ProtocolError> {
        match self.pushed.as_mut() {
            Some(pushed) => payloads::readings(&pushed.next()?),
            None => read_readings(&self.correlator, 1),
        }
    }

    fn apply(&mut self, action: ControlAction) -> Result<(), ProtocolError> {
        apply_action(&self.correlator, action, 1)
    }
}

/// A connected Gen2 analyzer
pub struct Gen2Analyzer {
    session: Session<TextProtocol>,
    correlator: Correlator<TextProtocol>,
    telemetry: PollerSlot,
    reporting: ReportingState,
}

impl Gen2Analyzer {
    pub fn connect(
        channel: Box<dyn CommunicationChannel>,
        config: SessionConfig,
    ) -> Result<Self, ProtocolError> {
        let protocol = TextProtocol::new(&config.text);
        let session = Session::connect(protocol, channel, config)?;
        Ok(Self::from_session(session))
    }

    pub fn from_session(session: Session<TextProtocol>) -> Self {
        let correlator = session.correlator();
        Self {
            session,
            correlator,
            telemetry: PollerSlot::default(),
            reporting: ReportingState::default(),
        }
    }

    pub fn session(&self) -> &Session<TextProtocol> {
        &self.session
    }

    fn request(&self, request: TextMessage) -> Result<TextMessage, ProtocolError> {
        exchange(&self.correlator, request, self.session.config().correlator.attempts)
    }

    pub fn ping(&self) -> Result<Duration, ProtocolError> {
        let start = Instant::now();
        self.request(TextMessage::new(MessageType::Ping))?;
        Ok(start.elapsed())
    }

    /// Firmware version, falling back to the free text of the reply
    pub fn read_version(&self) -> Result<String, ProtocolError> {
        let reply = self.request(TextMessage::new(MessageType::Vers))?;
        Ok(match reply.get("fw") {
            Some(fw) => fw.to_string(),
            None => reply.unparsed.trim().to_string(),
        })
    }

    pub fn read_readings(&self) -> Result<RawSample, ProtocolError> {
        read_readings(&self.correlator, self.session.config().correlator.attempts)
    }

    pub fn battery_status(&self) -> Result<BatteryStatus, ProtocolError> {
        let reply = self.request(TextMessage::new(MessageType::Bats))?;
        BatteryStatus::from_message(&reply)
    }

    pub fn drive_levels(&self) -> Result<DriveLevels, ProtocolError> {
        let reply = self.request(TextMessage::new(MessageType::Drvl))?;
        DriveLevels::from_message(&reply)
    }

    pub fn set_range(&self, range: Range) -> Result<(), ProtocolError> {
        self.request(payloads::range_request(range)).map(|_| ())
    }

    pub fn set_averaging_depth(&self, depth: u8) -> Result<(), ProtocolError> {
        self.request(payloads::averaging_request(depth)).map(|_| ())
    }

    pub fn set_periodic_reporting(&self, enabled: bool, period: Duration) -> Result<(), ProtocolError> {
        self.request(payloads::periodic_request(enabled, period.as_millis() as u64))?;
        self.reporting.set(enabled.then_some(period));
        Ok(())
    }

    /// Period of the unsolicited readings, if they are on
    pub fn periodic_reporting(&self) -> Option<Duration> {
        self.reporting.get()
    }

    pub fn pump(&self, on: bool) -> Result<(), ProtocolError> {
        self.request(payloads::pump_request(on)).map(|_| ())
    }

    pub fn ignite(&self, glow: Duration) -> Result<(), ProtocolError> {
        self.request(payloads::ignite_request(glow.as_millis() as u64))
            .map(|_| ())
    }

    fn check_slot(index: u8) -> Result<(), ProtocolError> {
        if index >= GEN2_CALIBRATION_SLOTS {
            return Err(ProtocolError::InvalidRequest(format!(
                "calibration slot {index} out of range (0..{GEN2_CALIBRATION_SLOTS})"
            )));
        }
        Ok(())
    }

    pub fn read_calibration(&self, index: u8) -> Result<CalibrationSlot, ProtocolError> {
        Self::check_slot(index)?;
        let reply = self.request(payloads::slot_request(MessageType::Calt, index))?;
        payloads::calibration_slot(&reply)
    }

    pub fn calibration_slots(&self) -> Result<Vec<CalibrationSlot>, ProtocolError> {
        (0..GEN2_CALIBRATION_SLOTS)
            .map(|index| self.read_calibration(index))
            .collect()
    }

    pub fn generate_calibration(&self, index: u8, ppm: f64) -> Result<CalibrationResult, ProtocolError> {
        Self::check_slot(index)?;
        if !ppm.is_finite() || ppm < 0.0 {
            return Err(ProtocolError::InvalidRequest(format!("reference ppm {ppm} out of range")));
        }
        self.telemetry.with(|poller| {
            if let Some(poller) = poller {
                poller.begin_calibration_capture();
            }
        });
        let reply = self.request(payloads::generate_calibration_request(index, ppm));
        let observed_ppm = self
            .telemetry
            .with(|poller| poller.and_then(|p| p.end_calibration_capture()));
        let slot = payloads::calibration_slot(&reply?)?;
        tracing::info!(session = %self.session.id(), slot = index, ppm, "calibration stored");
        Ok(CalibrationResult { slot, observed_ppm })
    }

    pub fn clear_calibration(&self, index: u8) -> Result<(), ProtocolError> {
        Self::check_slot(index)?;
        self.request(payloads::slot_request(MessageType::Cald, index))
            .map(|_| ())
    }

    /// Dump the device's stored log. The device answers with `LOGR` hex
    /// lines and closes with `LOGR END`.
    pub fn retrieve_logs(&self) -> Result<Vec<u8>, ProtocolError> {
        let parts = self.correlator.send_and_wait_multiple(
            TextMessage::new(MessageType::Logr),
            None,
            TextProtocol::is_log_end,
            LOG_RETRIEVAL_TIMEOUT,
        )?;
        let mut log = Vec::new();
        for part in &parts {
            log.extend(payloads::log_chunk(part)?);
        }
        tracing::info!(session = %self.session.id(), lines = parts.len(), bytes = log.len(), "device log retrieved");
        Ok(log)
    }

    pub fn flash(&self) -> FlashTransfer<'_, Self> {
        FlashTransfer::new(self, self.session.config().flash.clone())
            .with_events(self.session.events().clone())
    }

    pub fn update_firmware(&self, image: &[u8], password: u32) -> Result<UpdateReport, ProtocolError> {
        let reporting = self.periodic_reporting();
        if let Err(e) = self.set_periodic_reporting(false, Duration::ZERO) {
            tracing::warn!(session = %self.session.id(), "could not stop periodic reporting: {e}");
        }
        let config = self.session.config().firmware.clone();
        let result = self.telemetry.with(|poller| {
            FirmwareUpdater::new(&self.session, config)
                .pausing(poller)
                .run(payloads::update_mode_request(password), image)
        });
        if let Some(period) = reporting {
            if let Err(e) = self.set_periodic_reporting(true, period) {
                tracing::warn!(session = %self.session.id(), "could not restore periodic reporting: {e}");
            }
        }
        result
    }

    /// Start feeding readings into the telemetry pipeline, pushed by the
    /// device when `telemetry.periodic_reporting` is set, polled otherwise
    pub fn start_telemetry(&self, log: Option<LogTarget>) -> Result<(), ProtocolError> {
        let config = self.session.config().telemetry.clone();
        let pushed = if config.periodic_reporting {
            self.set_periodic_reporting(true, config.polling_interval())?;
            Some(PushedSamples::new(
                self.correlator.clone(),
                MessageType::Rdng,
                config.pushed_sample_wait(),
            ))
        } else {
            None
        };
        let source = Gen2Telemetry {
            correlator: self.correlator.clone(),
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

    pub fn shutdown(&self) {
        self.telemetry.stop();
        self.session.shutdown();
    }
}

impl Drop for Gen2Analyzer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl FlashAccess for Gen2Analyzer {
    fn chunk_size(&self) -> usize {
        GEN2_FLASH_CHUNK
    }

    fn write_chunk(&self, address: u32, data: &[u8]) -> Result<(), ProtocolError> {
        let reply = self.correlator.send_and_wait(
            payloads::flash_write_request(address, data),
            MessageType::Flwr,
            self.session.config().flash.chunk_timeout(),
        )?;
        let acked = reply.get_i64("addr")? as u32;
        if acked != address {
            return Err(ProtocolError::InvalidResponse(format!(
                "write acknowledged at {acked:#010x}, sent {address:#010x}"
            )));
        }
        Ok(())
    }

    fn read_chunk(&self, address: u32, length: usize) -> Result<Vec<u8>, ProtocolError> {
        let reply = self.correlator.send_and_wait(
            payloads::flash_read_request(address, length),
            MessageType::Flrd,
            self.session.config().flash.chunk_timeout(),
        )?;
        let (answered, data) = payloads::flash_read_data(&reply)?;
        if answered != address {
            return Err(ProtocolError::InvalidResponse(format!(
                "asked for {address:#010x}, device answered {answered:#010x}"
            )));
        }
        Ok(data)
    }
}
