//! Typed device operations for both analyzer generations
//!
//! [`Gen1Analyzer`] and [`Gen2Analyzer`] wrap a session with the operations
//! the telemetry pipeline, the transfer protocols and the CLI need.

pub mod gen1;
pub mod gen2;
pub mod poller;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub use gen1::Gen1Analyzer;
pub use gen2::Gen2Analyzer;
pub use poller::{LogTarget, PollerSlot, TelemetryPoller};

use crate::protocol::{ProtocolError, WireProtocol};
use crate::session::Correlator;
use crate::telemetry::{ControlAction, RawSample};

/// One calibration table entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSlot {
    pub index: u8,
    /// Reference gas concentration
    pub ppm: f64,
    /// FID current measured against the reference, pico-amps
    pub fid_current: f64,
    /// H2 pressure during calibration, psi
    pub h2_pressure: f64,
    pub is_valid: bool,
    pub timestamp: Option<DateTime<Utc>>,
    /// Written at the factory rather than in the field
    pub is_factory: bool,
}

/// Result of generating a calibration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub slot: CalibrationSlot,
    /// Mean composite ppm the host observed while the device calibrated
    pub observed_ppm: Option<f64>,
}

/// Where the telemetry poller gets samples and sends adjustments
pub trait TelemetrySource: Send {
    fn read_raw_sample(&mut self) -> Result<RawSample, ProtocolError>;

    fn apply(&mut self, action: ControlAction) -> Result<(), ProtocolError>;
}

/// Samples the device sends on its own once periodic reporting is on.
///
/// They land in the session store like any reply; this hands each one to
/// the poller exactly once.
pub(crate) struct PushedSamples<P: WireProtocol> {
    correlator: Correlator<P>,
    key: P::Key,
    since: Instant,
    wait: Duration,
}

impl<P: WireProtocol> PushedSamples<P> {
    pub(crate) fn new(correlator: Correlator<P>, key: P::Key, wait: Duration) -> Self {
        Self {
            correlator,
            key,
            since: Instant::now(),
            wait,
        }
    }

    pub(crate) fn next(&mut self) -> Result<P::Incoming, ProtocolError> {
        let timeout = self.since.elapsed() + self.wait;
        let message = self.correlator.wait_for(self.key, self.since, timeout)?;
        self.since = Instant::now();
        Ok(message)
    }
}

/// Periodic reporting period last confirmed by the device, if enabled
#[derive(Debug, Default)]
pub(crate) struct ReportingState(Mutex<Option<Duration>>);

impl ReportingState {
    pub(crate) fn get(&self) -> Option<Duration> {
        self.0.lock().map(|p| *p).unwrap_or_else(|e| *e.into_inner())
    }

    pub(crate) fn set(&self, period: Option<Duration>) {
        match self.0.lock() {
            Ok(mut p) => *p = period,
            Err(e) => *e.into_inner() = period,
        }
    }
}
