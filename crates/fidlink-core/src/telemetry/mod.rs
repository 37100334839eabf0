//! Telemetry pipeline
//!
//! Raw instrument samples go through, in order:
//! 1. junk rejection ([`junk`])
//! 2. ignition debounce ([`ignition`])
//! 3. range hysteresis ([`range`])
//! 4. moving averages and adaptive hardware averaging ([`averaging`])
//!
//! [`pipeline::TelemetryPipeline`] strings them together and
//! [`logline`] formats accepted samples for the log sink.

pub mod averaging;
pub mod ignition;
pub mod junk;
pub mod logline;
pub mod pipeline;
pub mod range;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use averaging::{round_ppm, Averager, Averages, DepthPolicy, MovingWindow};
pub use ignition::IgnitionDebouncer;
pub use junk::{is_junk, JunkFilter, JunkVerdict};
pub use logline::{format_line, header_line, LogBuffer, TELEMETRY_FIELDS};
pub use pipeline::{PipelineOutcome, PipelineStep, TelemetryPipeline};
pub use range::RangeController;

/// Front-end gain range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Range {
    /// High sensitivity, low concentrations
    #[default]
    Low,
    /// Low sensitivity, high concentrations
    Max,
}

impl Range {
    /// Value carried by range commands on both wire formats
    pub fn wire_value(&self) -> u8 {
        match self {
            Range::Low => 0,
            Range::Max => 1,
        }
    }

    pub fn from_wire(value: u8) -> Self {
        if value == 0 {
            Range::Low
        } else {
            Range::Max
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Range::Low => "low",
            Range::Max => "max",
        }
    }
}

/// One reading as the instrument reports it, in engineering units
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RawSample {
    pub battery_volts: f64,
    pub pico_amps: f64,
    pub thermocouple_c: f64,
    pub internal_temp_c: f64,
    pub h2_tank_psi: f64,
    pub h2_low_psi: f64,
    pub sample_psia: f64,
    pub pump_power_pct: f64,
    pub pump_current_ma: f64,
    pub raw_ppm: f64,
    pub primary_solenoid: bool,
    pub secondary_solenoid: bool,
    pub primary_pump: bool,
    pub secondary_pump: bool,
    pub glow_plug: bool,
    pub range: Range,
    /// Hardware averaging depth the device is currently using
    pub hardware_averaging: u8,
}

/// An accepted sample with everything the pipeline derived from it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub timestamp: DateTime<Utc>,
    pub raw: RawSample,
    /// Debounced flame state
    pub ignited: bool,
    pub short_average_ppm: f64,
    pub long_average_ppm: f64,
    /// Value to display: an average when stable, the raw reading otherwise
    pub composite_ppm: f64,
    /// False when the short window strayed outside the stability band
    pub stable: bool,
    /// Range in effect once this sample was processed
    pub range: Range,
    /// Accepted only because the junk retry budget ran out
    pub junk: bool,
}

/// Adjustment the pipeline wants pushed back to the instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlAction {
    SwitchRange(Range),
    SetAveragingDepth(u8),
}
