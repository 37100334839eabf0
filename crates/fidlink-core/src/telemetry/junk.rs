//! Junk sample rejection
//!
//! The link occasionally delivers physically impossible readings. They are
//! re-read a bounded number of times; once the budget is spent the sample
//! is let through so telemetry never stalls.

use super::RawSample;

pub const MAX_BATTERY_VOLTS: f64 = 15.0;
pub const MIN_PICO_AMPS: f64 = -10_000.0;
pub const MIN_THERMOCOUPLE_C: f64 = -400.0;
pub const MAX_PUMP_POWER_PCT: f64 = 100.0;

/// Whether a reading is outside physically plausible bounds
pub fn is_junk(sample: &RawSample) -> bool {
    sample.battery_volts > MAX_BATTERY_VOLTS
        || sample.pico_amps < MIN_PICO_AMPS
        || sample.thermocouple_c < MIN_THERMOCOUPLE_C
        || sample.pump_power_pct > MAX_PUMP_POWER_PCT
}

/// What to do with a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JunkVerdict {
    Accept,
    /// Discard and read again after the retry delay
    Retry,
    /// Junk, but the retry budget is spent
    AcceptJunk,
}

#[derive(Debug, Clone)]
pub struct JunkFilter {
    consecutive: u32,
    max_retries: u32,
}

impl JunkFilter {
    pub fn new(max_retries: u32) -> Self {
        Self {
            consecutive: 0,
            max_retries,
        }
    }

    /// Consecutive junk samples retried so far
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn check(&mut self, sample: &RawSample) -> JunkVerdict {
        if !is_junk(sample) {
            self.consecutive = 0;
            return JunkVerdict::Accept;
        }
        if self.consecutive < self.max_retries {
            self.consecutive += 1;
            JunkVerdict::Retry
        } else {
            self.consecutive = 0;
            JunkVerdict::AcceptJunk
        }
    }
}
