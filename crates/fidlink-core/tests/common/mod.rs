//! Shared setup for the integration tests

#![allow(dead_code)]

use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

use fidlink_core::config::SessionConfig;
use fidlink_core::device::{Gen1Analyzer, Gen2Analyzer};
use fidlink_core::session::SessionEvent;
use fidlink_core::sim::{Gen1Sim, Gen2Sim, SimLink};
use tracing_subscriber::EnvFilter;

/// Route library logs through the test harness; `RUST_LOG` picks the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Short timeouts so the simulator tests finish quickly
pub fn fast_config() -> SessionConfig {
    init_tracing();
    let mut config = SessionConfig::default();
    config.read_timeout_ms = 20;
    config.correlator.poll_interval_ms = 2;
    config.correlator.default_timeout_ms = 500;
    config.correlator.retry_backoff_ms = 5;
    config.watchdog.enabled = false;
    config.flash.retry_backoff_ms = 0;
    config.flash.chunk_timeout_ms = 500;
    config.firmware.quiesce_ms = 500;
    config.firmware.ready_timeout_ms = 300;
    config.firmware.ack_timeout_ms = 1_000;
    config.firmware.poll_interval_ms = 2;
    config.telemetry.polling_interval_ms = 20;
    config.telemetry.junk_retry_delay_ms = 1;
    config.telemetry.range_settle_ms = 10;
    config.telemetry.log_flush_lines = 5;
    config
}

pub fn gen1(sim: Gen1Sim, config: SessionConfig) -> (Gen1Analyzer, SimLink<Gen1Sim>) {
    let link = SimLink::new(sim);
    let analyzer = Gen1Analyzer::connect(Box::new(link.clone()), config).unwrap();
    (analyzer, link)
}

pub fn gen2(sim: Gen2Sim, config: SessionConfig) -> (Gen2Analyzer, SimLink<Gen2Sim>) {
    let link = SimLink::new(sim);
    let analyzer = Gen2Analyzer::connect(Box::new(link.clone()), config).unwrap();
    (analyzer, link)
}

/// Receive events until one matches or `timeout` runs out
pub fn wait_for_event(
    events: &Receiver<SessionEvent>,
    timeout: Duration,
    matches: impl Fn(&SessionEvent) -> bool,
) -> Option<SessionEvent> {
    let deadline = Instant::now() + timeout;
    loop {
        let left = deadline.checked_duration_since(Instant::now())?;
        match events.recv_timeout(left) {
            Ok(event) if matches(&event) => return Some(event),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

/// Poll `condition` until it holds or `timeout` runs out
pub fn eventually(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
