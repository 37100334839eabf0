//! Per-session telemetry pipeline

use chrono::Utc;
use std::time::Duration;

use super::averaging::{Averager, DepthPolicy, MovingWindow};
use super::ignition::IgnitionDebouncer;
use super::junk::{JunkFilter, JunkVerdict};
use super::range::RangeController;
use super::{ControlAction, RawSample, TelemetrySample};
use crate::config::TelemetryConfig;

/// Capacity of the calibration history window
pub const CALIBRATION_HISTORY_CAPACITY: usize = 250;

/// Result of processing one raw sample
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineStep {
    /// Junk: discard and read again after the delay
    Retry(Duration),
    Accepted(PipelineOutcome),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutcome {
    pub sample: TelemetrySample,
    /// Adjustments to push to the device, in order
    pub actions: Vec<ControlAction>,
    /// Pause before the next read (range switch settle)
    pub settle: Option<Duration>,
    /// Debounced flame state flipped on this sample
    pub ignition_changed: bool,
}

/// Junk filter, ignition debounce, range hysteresis and averaging for one
/// device. Owned by a single thread.
#[derive(Debug, Clone)]
pub struct TelemetryPipeline {
    config: TelemetryConfig,
    junk: JunkFilter,
    ignition: IgnitionDebouncer,
    range: RangeController,
    averager: Averager,
    depth: DepthPolicy,
    calibration_history: Option<MovingWindow>,
    accepted: u64,
}

impl TelemetryPipeline {
    pub fn new(config: TelemetryConfig) -> Self {
        Self {
            junk: JunkFilter::new(config.max_junk_retries),
            ignition: IgnitionDebouncer::new(config.ignition_threshold_c, config.ignition_debounce),
            range: RangeController::new(config.range_up_pico_amps, config.range_down_pico_amps),
            averager: Averager::new(
                config.ring_capacity,
                config.long_window,
                config.short_window,
                config.stability_band_pct,
            ),
            depth: DepthPolicy::new(
                config.averaging_threshold_pico_amps,
                config.fast_averaging_depth,
                config.slow_averaging_depth,
            ),
            calibration_history: None,
            accepted: 0,
            config,
        }
    }

    /// Samples accepted so far
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn ignited(&self) -> Option<bool> {
        self.ignition.state()
    }

    pub fn process(&mut self, raw: RawSample) -> PipelineStep {
        let junk = match self.junk.check(&raw) {
            JunkVerdict::Retry => {
                tracing::debug!(
                    consecutive = self.junk.consecutive(),
                    "junk sample, re-reading"
                );
                return PipelineStep::Retry(self.config.junk_retry_delay());
            }
            JunkVerdict::AcceptJunk => {
                tracing::warn!("accepting junk sample after {} retries", self.config.max_junk_retries);
                true
            }
            JunkVerdict::Accept => false,
        };

        let (ignited, ignition_changed) = self.ignition.update(&raw);
        if ignition_changed {
            tracing::info!(ignited, "flame state changed");
        }

        let mut actions = Vec::new();
        let mut settle = None;
        let mut range = raw.range;
        if let Some(next) = self.range.evaluate(raw.range, raw.pico_amps) {
            tracing::info!(from = raw.range.as_str(), to = next.as_str(), pico_amps = raw.pico_amps, "switching range");
            actions.push(ControlAction::SwitchRange(next));
            settle = Some(self.config.range_settle());
            range = next;
        }

        if let Some(depth) = self.depth.evaluate(raw.pico_amps, raw.hardware_averaging) {
            tracing::debug!(depth, pico_amps = raw.pico_amps, "changing hardware averaging");
            actions.push(ControlAction::SetAveragingDepth(depth));
        }

        let averages = self.averager.push(raw.raw_ppm, raw.range);
        if let Some(history) = self.calibration_history.as_mut() {
            history.push(averages.composite);
        }

        self.accepted += 1;
        PipelineStep::Accepted(PipelineOutcome {
            sample: TelemetrySample {
                timestamp: Utc::now(),
                raw,
                ignited,
                short_average_ppm: averages.short,
                long_average_ppm: averages.long,
                composite_ppm: averages.composite,
                stable: averages.stable,
                range,
                junk,
            },
            actions,
            settle,
            ignition_changed,
        })
    }

    /// A pushed action was not applied by the device
    pub fn action_failed(&mut self, action: ControlAction) {
        if let ControlAction::SetAveragingDepth(_) = action {
            self.depth.request_failed();
        }
    }

    /// Start recording composite ppm into the calibration history
    pub fn begin_calibration_capture(&mut self) {
        self.calibration_history = Some(MovingWindow::new(CALIBRATION_HISTORY_CAPACITY));
    }

    /// Stop recording and return the mean of what was captured
    pub fn end_calibration_capture(&mut self) -> Option<f64> {
        self.calibration_history.take().and_then(|w| w.mean())
    }
}
