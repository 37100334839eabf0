//! Telemetry poller
//!
//! One thread per session owns the pipeline: it reads a raw sample, runs it
//! through the pipeline, pushes any control actions back to the device,
//! publishes the result and appends a log line. Junk retries and range
//! settling happen here so the receive loop never waits on them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::TelemetrySource;
use crate::config::TelemetryConfig;
use crate::session::{sleep_while, EventBus, SessionEvent};
use crate::sink::LogSink;
use crate::telemetry::{
    format_line, header_line, ControlAction, LogBuffer, PipelineStep, TelemetryPipeline,
};

#[derive(Default)]
struct Control {
    stop: AtomicBool,
    pause: AtomicBool,
    paused: AtomicBool,
}

/// Handle to a running poller thread
pub struct TelemetryPoller {
    control: Arc<Control>,
    pipeline: Arc<Mutex<TelemetryPipeline>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Log destination for a poller
pub struct LogTarget {
    pub sink: Box<dyn LogSink>,
    /// Log name passed to the sink
    pub name: String,
}

impl TelemetryPoller {
    pub fn spawn(
        source: Box<dyn TelemetrySource>,
        config: TelemetryConfig,
        events: EventBus,
        log: Option<LogTarget>,
    ) -> std::io::Result<Self> {
        let control = Arc::new(Control::default());
        let pipeline = Arc::new(Mutex::new(TelemetryPipeline::new(config.clone())));
        let handle = {
            let control = Arc::clone(&control);
            let pipeline = Arc::clone(&pipeline);
            thread::Builder::new()
                .name("fidlink-telemetry".into())
                .spawn(move || run(control, pipeline, source, config, events, log))?
        };
        Ok(Self {
            control,
            pipeline,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Stop reading after the current sample
    pub fn pause(&self) {
        self.control.pause.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.control.pause.store(false, Ordering::SeqCst);
    }

    /// Wait until the thread has acknowledged a pause
    pub fn wait_paused(&self, timeout: Duration) -> bool {
        sleep_while(timeout, || {
            !self.control.paused.load(Ordering::SeqCst) && self.is_running()
        });
        self.control.paused.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.control.paused.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .map(|h| h.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// Samples accepted so far
    pub fn accepted(&self) -> u64 {
        self.pipeline.lock().map(|p| p.accepted()).unwrap_or(0)
    }

    pub fn begin_calibration_capture(&self) {
        if let Ok(mut pipeline) = self.pipeline.lock() {
            pipeline.begin_calibration_capture();
        }
    }

    pub fn end_calibration_capture(&self) -> Option<f64> {
        self.pipeline
            .lock()
            .ok()
            .and_then(|mut p| p.end_calibration_capture())
    }

    /// Stop the thread and wait for it; buffered log lines are flushed
    pub fn stop(&self) {
        self.control.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().ok().and_then(|mut h| h.take()) {
            let _ = handle.join();
        }
    }
}

impl Drop for TelemetryPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

fn flush(log: &mut Option<LogTarget>, buffer: &mut LogBuffer) {
    let Some(target) = log.as_mut() else {
        return;
    };
    if buffer.is_empty() {
        return;
    }
    let lines = buffer.take();
    if let Err(e) = target.sink.append_lines(&target.name, &lines) {
        tracing::warn!(log = %target.name, "failed to write {} log lines: {e}", lines.len());
    }
}

fn run(
    control: Arc<Control>,
    pipeline: Arc<Mutex<TelemetryPipeline>>,
    mut source: Box<dyn TelemetrySource>,
    config: TelemetryConfig,
    events: EventBus,
    mut log: Option<LogTarget>,
) {
    let mut buffer = LogBuffer::new(config.log_flush_lines);
    if let Some(target) = log.as_mut() {
        if !target.sink.exists(&target.name) {
            if let Err(e) = target.sink.append_lines(&target.name, &[header_line()]) {
                tracing::warn!(log = %target.name, "failed to write log header: {e}");
            }
        }
    }

    let stopped = || control.stop.load(Ordering::SeqCst);
    let running = || !stopped() && !control.pause.load(Ordering::SeqCst);
    tracing::debug!("telemetry poller started");

    while !stopped() {
        if control.pause.load(Ordering::SeqCst) {
            control.paused.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(25));
            continue;
        }
        control.paused.store(false, Ordering::SeqCst);

        let raw = match source.read_raw_sample() {
            Ok(raw) => raw,
            Err(e) if e.is_reconnect_needed() => {
                tracing::warn!("telemetry stopped: {e}");
                break;
            }
            Err(e) => {
                tracing::debug!("sample read failed: {e}");
                sleep_while(config.polling_interval(), running);
                continue;
            }
        };

        let step = match pipeline.lock() {
            Ok(mut pipeline) => pipeline.process(raw),
            Err(_) => break,
        };
        let outcome = match step {
            PipelineStep::Retry(delay) => {
                sleep_while(delay, running);
                continue;
            }
            PipelineStep::Accepted(outcome) => outcome,
        };

        for action in &outcome.actions {
            match source.apply(*action) {
                Ok(()) => {
                    if let ControlAction::SwitchRange(range) = action {
                        events.publish(SessionEvent::RangeChanged(*range));
                    }
                }
                Err(e) => {
                    tracing::warn!("failed to apply {action:?}: {e}");
                    if let Ok(mut pipeline) = pipeline.lock() {
                        pipeline.action_failed(*action);
                    }
                }
            }
        }
        if outcome.ignition_changed {
            events.publish(SessionEvent::IgnitionChanged {
                ignited: outcome.sample.ignited,
            });
        }

        if log.is_some() && buffer.push(format_line(&outcome.sample)) {
            flush(&mut log, &mut buffer);
        }
        events.publish(SessionEvent::Telemetry(outcome.sample));

        if let Some(settle) = outcome.settle {
            sleep_while(settle, || !stopped());
        }
        sleep_while(config.polling_interval(), running);
    }

    flush(&mut log, &mut buffer);
    tracing::debug!("telemetry poller stopped");
}

/// Optional poller owned by a device
#[derive(Default)]
pub struct PollerSlot {
    poller: Mutex<Option<TelemetryPoller>>,
}

impl PollerSlot {
    /// Start a poller, replacing any running one
    pub fn start(
        &self,
        source: Box<dyn TelemetrySource>,
        config: TelemetryConfig,
        events: EventBus,
        log: Option<LogTarget>,
    ) -> std::io::Result<()> {
        let poller = TelemetryPoller::spawn(source, config, events, log)?;
        if let Ok(mut slot) = self.poller.lock() {
            if let Some(old) = slot.replace(poller) {
                old.stop();
            }
        }
        Ok(())
    }

    pub fn stop(&self) {
        let poller = self.poller.lock().ok().and_then(|mut p| p.take());
        if let Some(poller) = poller {
            poller.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.with(|p| p.is_some_and(|p| p.is_running()))
    }

    /// Run `f` with the current poller, if any
    pub fn with<T>(&self, f: impl FnOnce(Option<&TelemetryPoller>) -> T) -> T {
        match self.poller.lock() {
            Ok(slot) => f(slot.as_ref()),
            Err(_) => f(None),
        }
    }
}
