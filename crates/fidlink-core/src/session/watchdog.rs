//! Link watchdog
//!
//! [`assess`] is the whole decision: it looks at one activity snapshot and
//! says what to do. The thread around it only samples, acts and pings.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{sleep_while, Correlator, SessionEvent, Shared};
use crate::config::WatchdogConfig;
use crate::protocol::WireProtocol;

/// Link activity as seen by the watchdog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySnapshot {
    /// Since any byte was received
    pub since_last_byte: Duration,
    /// Since a complete message was decoded
    pub since_last_parse: Duration,
    pub receive_running: bool,
    /// Firmware update in progress; parses are not expected
    pub raw_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogVerdict {
    Healthy,
    /// First check of a stale episode
    Stale(Duration),
    /// Silent with no receive loop running; start one before giving up
    RestartReceiver,
    /// The link is dead
    Fatal(String),
}

/// What the watchdog remembers between checks
#[derive(Debug, Clone, Default)]
pub struct WatchdogState {
    stale_reported: bool,
    receiver_restarted: bool,
    last_ping: Option<Instant>,
}

impl WatchdogState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a liveness probe is due at `now`; records it if so
    pub fn ping_due(&mut self, config: &WatchdogConfig, now: Instant) -> bool {
        if config.ping_interval_ms == 0 {
            return false;
        }
        let interval = Duration::from_millis(config.ping_interval_ms);
        match self.last_ping {
            Some(last) if now.duration_since(last) < interval => false,
            _ => {
                self.last_ping = Some(now);
                true
            }
        }
    }
}

pub fn assess(
    config: &WatchdogConfig,
    activity: &ActivitySnapshot,
    state: &mut WatchdogState,
) -> WatchdogVerdict {
    let quiet = Duration::from_millis(config.quiet_period_ms);
    if activity.since_last_byte >= quiet {
        if !activity.receive_running && !state.receiver_restarted {
            state.receiver_restarted = true;
            return WatchdogVerdict::RestartReceiver;
        }
        return WatchdogVerdict::Fatal(format!(
            "nothing received for {}s",
            activity.since_last_byte.as_secs()
        ));
    }

    if activity.raw_mode {
        state.stale_reported = false;
        return WatchdogVerdict::Healthy;
    }

    if activity.since_last_parse >= Duration::from_millis(config.max_parse_gap_ms) {
        return WatchdogVerdict::Fatal(format!(
            "no valid message for {}s",
            activity.since_last_parse.as_secs()
        ));
    }

    let stale_after = Duration::from_millis(config.polling_interval_ms + config.stale_grace_ms);
    if activity.since_last_parse >= stale_after {
        if state.stale_reported {
            return WatchdogVerdict::Healthy;
        }
        state.stale_reported = true;
        return WatchdogVerdict::Stale(activity.since_last_parse);
    }

    state.stale_reported = false;
    WatchdogVerdict::Healthy
}

pub(crate) fn watchdog_loop<P: WireProtocol>(shared: Arc<Shared<P>>) {
    let config = shared.config.watchdog.clone();
    let correlator = Correlator::new(Arc::clone(&shared));
    let mut state = WatchdogState::new();

    loop {
        if !sleep_while(config.check_interval(), || !shared.is_shut_down()) {
            break;
        }
        if shared.reconnect_pending() {
            break;
        }

        match assess(&config, &shared.activity(), &mut state) {
            WatchdogVerdict::Healthy => {}
            WatchdogVerdict::Stale(gap) => {
                tracing::warn!(session = %shared.id, "link stale: no valid message for {gap:?}");
                shared.events.publish(SessionEvent::LinkStale {
                    since_last_parse: gap,
                });
            }
            WatchdogVerdict::RestartReceiver => {
                tracing::warn!(session = %shared.id, "receive loop not running, restarting it");
                if !shared.restart_receiver() {
                    shared.signal_reconnect("receive loop stopped and could not be restarted");
                    break;
                }
            }
            WatchdogVerdict::Fatal(reason) => {
                shared.signal_reconnect(reason);
                break;
            }
        }

        if !shared.raw_requested() && state.ping_due(&config, Instant::now()) {
            let ping = shared.protocol.ping();
            if let Err(e) = correlator.send(ping) {
                tracing::debug!(session = %shared.id, "ping not sent: {e}");
            }
        }
    }
    tracing::debug!(session = %shared.id, "watchdog stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(byte_s: u64, parse_s: u64) -> ActivitySnapshot {
        ActivitySnapshot {
            since_last_byte: Duration::from_secs(byte_s),
            since_last_parse: Duration::from_secs(parse_s),
            receive_running: true,
            raw_mode: false,
        }
    }

    #[test]
    fn test_fresh_link_is_healthy() {
        let config = WatchdogConfig::default();
        let mut state = WatchdogState::new();
        assert_eq!(assess(&config, &snapshot(0, 1), &mut state), WatchdogVerdict::Healthy);
    }

    #[test]
    fn test_stale_reported_once_per_episode() {
        let config = WatchdogConfig::default();
        let mut state = WatchdogState::new();
        assert_eq!(
            assess(&config, &snapshot(1, 4), &mut state),
            WatchdogVerdict::Stale(Duration::from_secs(4))
        );
        assert_eq!(assess(&config, &snapshot(1, 5), &mut state), WatchdogVerdict::Healthy);
        assert_eq!(assess(&config, &snapshot(0, 0), &mut state), WatchdogVerdict::Healthy);
        assert!(matches!(
            assess(&config, &snapshot(1, 4), &mut state),
            WatchdogVerdict::Stale(_)
        ));
    }

    #[test]
    fn test_parse_gap_fatal() {
        let config = WatchdogConfig::default();
        let mut state = WatchdogState::new();
        assert!(matches!(
            assess(&config, &snapshot(1, 121), &mut state),
            WatchdogVerdict::Fatal(_)
        ));
    }

    #[test]
    fn test_quiet_link_restarts_receiver_once() {
        let config = WatchdogConfig::default();
        let mut state = WatchdogState::new();
        let mut quiet = snapshot(31, 31);
        quiet.receive_running = false;
        assert_eq!(assess(&config, &quiet, &mut state), WatchdogVerdict::RestartReceiver);
        assert!(matches!(assess(&config, &quiet, &mut state), WatchdogVerdict::Fatal(_)));
    }

    #[test]
    fn test_quiet_with_running_receiver_is_fatal() {
        let config = WatchdogConfig::default();
        let mut state = WatchdogState::new();
        assert!(matches!(
            assess(&config, &snapshot(30, 30), &mut state),
            WatchdogVerdict::Fatal(_)
        ));
    }

    #[test]
    fn test_raw_mode_suppresses_parse_checks() {
        let config = WatchdogConfig::default();
        let mut state = WatchdogState::new();
        let mut snap = snapshot(0, 200);
        snap.raw_mode = true;
        assert_eq!(assess(&config, &snap, &mut state), WatchdogVerdict::Healthy);
    }

    #[test]
    fn test_ping_interval() {
        let config = WatchdogConfig::default();
        let mut state = WatchdogState::new();
        let start = Instant::now();
        assert!(state.ping_due(&config, start));
        assert!(!state.ping_due(&config, start + Duration::from_secs(1)));
        assert!(state.ping_due(&config, start + Duration::from_secs(5)));
    }
}
