//! Session configuration
//!
//! Every tunable of the engine lives here. All durations are milliseconds so
//! the JSON form stays readable; missing fields fall back to the defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors loading or saving configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

/// Top-level configuration for one analyzer session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Transport read timeout; bounds shutdown latency
    pub read_timeout_ms: u64,
    /// Consecutive receive I/O failures before the link is declared dead
    pub io_failure_limit: u32,
    pub correlator: CorrelatorConfig,
    pub text: TextCodecConfig,
    pub telemetry: TelemetryConfig,
    pub watchdog: WatchdogConfig,
    pub flash: FlashConfig,
    pub firmware: FirmwareConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 100,
            io_failure_limit: 5,
            correlator: CorrelatorConfig::default(),
            text: TextCodecConfig::default(),
            telemetry: TelemetryConfig::default(),
            watchdog: WatchdogConfig::default(),
            flash: FlashConfig::default(),
            firmware: FirmwareConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Parse from a JSON string
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Save as pretty-printed JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &str, message: &str) -> ConfigError {
            ConfigError::InvalidValue {
                field: field.to_string(),
                message: message.to_string(),
            }
        }

        if self.read_timeout_ms == 0 {
            return Err(invalid("read_timeout_ms", "must be finite and non-zero"));
        }
        if self.correlator.poll_interval_ms == 0 {
            return Err(invalid("correlator.poll_interval_ms", "must be non-zero"));
        }
        let t = &self.telemetry;
        if t.short_window == 0 || t.long_window == 0 {
            return Err(invalid("telemetry", "averaging windows must be non-zero"));
        }
        if t.short_window > t.long_window || t.long_window > t.ring_capacity {
            return Err(invalid(
                "telemetry",
                "short_window <= long_window <= ring_capacity must hold",
            ));
        }
        if t.range_down_pico_amps >= t.range_up_pico_amps {
            return Err(invalid(
                "telemetry.range_down_pico_amps",
                "must be below range_up_pico_amps",
            ));
        }
        if self.text.host_prefix.is_empty() || self.text.host_prefix.contains(' ') {
            return Err(invalid("text.host_prefix", "must be a single non-empty token"));
        }
        Ok(())
    }
}

/// Request/response correlation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    /// Interval between polls of the response store
    pub poll_interval_ms: u64,
    /// Timeout used when a caller does not supply one
    pub default_timeout_ms: u64,
    /// Attempts for `send_and_wait_retrying`
    pub attempts: u32,
    /// Delay before re-sending after a timeout
    pub retry_backoff_ms: u64,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 20,
            default_timeout_ms: 2_000,
            attempts: 3,
            retry_backoff_ms: 50,
        }
    }
}

impl CorrelatorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Gen2 text codec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextCodecConfig {
    /// First token of every line the host sends
    pub host_prefix: String,
    /// Consecutive discarded lines before a read gives up
    pub max_discards: u32,
    /// Longest line accepted without a terminator
    pub max_line_length: usize,
}

impl Default for TextCodecConfig {
    fn default() -> Self {
        Self {
            host_prefix: crate::protocol::text::HOST_PREFIX.to_string(),
            max_discards: 5,
            max_line_length: 4096,
        }
    }
}

/// Telemetry pipeline and poller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Interval between status reads
    pub polling_interval_ms: u64,
    /// Have the device push samples every polling interval instead of
    /// asking for each one
    pub periodic_reporting: bool,
    /// Delay before re-reading after a junk sample
    pub junk_retry_delay_ms: u64,
    /// Consecutive junk samples retried before one is accepted
    pub max_junk_retries: u32,
    /// Consecutive disagreeing samples needed to flip the ignition state
    pub ignition_debounce: u32,
    /// Thermocouple reading above which the flame counts as lit
    pub ignition_threshold_c: f64,
    /// Switch low -> max at or above this current
    pub range_up_pico_amps: f64,
    /// Switch max -> low at or below this current
    pub range_down_pico_amps: f64,
    /// Pause after a range switch before the next read
    pub range_settle_ms: u64,
    /// Raw ppm ring capacity
    pub ring_capacity: usize,
    pub long_window: usize,
    pub short_window: usize,
    /// Allowed deviation of short-window samples from the long average
    pub stability_band_pct: f64,
    /// Current at which the hardware averaging depth toggles
    pub averaging_threshold_pico_amps: f64,
    /// Depth used at or above the threshold
    pub fast_averaging_depth: u8,
    /// Depth used below the threshold
    pub slow_averaging_depth: u8,
    /// Buffered log lines before a flush to the sink
    pub log_flush_lines: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            polling_interval_ms: 1_000,
            periodic_reporting: false,
            junk_retry_delay_ms: 100,
            max_junk_retries: 10,
            ignition_debounce: 3,
            ignition_threshold_c: 75.0,
            range_up_pico_amps: 6_500.0,
            range_down_pico_amps: 6_000.0,
            range_settle_ms: 500,
            ring_capacity: 50,
            long_window: 25,
            short_window: 5,
            stability_band_pct: 10.0,
            averaging_threshold_pico_amps: 100.0,
            fast_averaging_depth: 10,
            slow_averaging_depth: 50,
            log_flush_lines: 20,
        }
    }
}

impl TelemetryConfig {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    /// How long the poller waits for a pushed sample before logging a miss
    pub fn pushed_sample_wait(&self) -> Duration {
        self.polling_interval() * 3
    }

    pub fn junk_retry_delay(&self) -> Duration {
        Duration::from_millis(self.junk_retry_delay_ms)
    }

    pub fn range_settle(&self) -> Duration {
        Duration::from_millis(self.range_settle_ms)
    }
}

/// Session watchdog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    /// Watchdog tick
    pub check_interval_ms: u64,
    /// Expected interval between successful parses
    pub polling_interval_ms: u64,
    /// Grace on top of the polling interval before a stale warning
    pub stale_grace_ms: u64,
    /// Parse gap treated as a dead link
    pub max_parse_gap_ms: u64,
    /// Silence (no bytes at all) treated as a dead link
    pub quiet_period_ms: u64,
    /// Interval of the "are you there" probe; 0 disables it
    pub ping_interval_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_ms: 1_000,
            polling_interval_ms: 1_000,
            stale_grace_ms: 2_000,
            max_parse_gap_ms: 120_000,
            quiet_period_ms: 30_000,
            ping_interval_ms: 5_000,
        }
    }
}

impl WatchdogConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

/// Chunked flash transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashConfig {
    /// Retries of one chunk before the transfer fails
    pub max_chunk_retries: u32,
    /// Fixed delay between retries of a chunk
    pub retry_backoff_ms: u64,
    /// Timeout for one chunk acknowledgement or read
    pub chunk_timeout_ms: u64,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            max_chunk_retries: 10,
            retry_backoff_ms: 100,
            chunk_timeout_ms: 1_500,
        }
    }
}

impl FlashConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }
}

/// Raw firmware block transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareConfig {
    /// Restart handshakes allowed in one update
    pub max_restarts: u32,
    /// Wait for the receive loop and telemetry to go quiet
    pub quiesce_ms: u64,
    /// Wait for the bootloader ready marker
    pub ready_timeout_ms: u64,
    /// Wait for each raw acknowledgement token
    pub ack_timeout_ms: u64,
    /// Raw byte poll interval
    pub poll_interval_ms: u64,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            quiesce_ms: 500,
            ready_timeout_ms: 10_000,
            ack_timeout_ms: 5_000,
            poll_interval_ms: 5,
        }
    }
}

impl FirmwareConfig {
    pub fn quiesce(&self) -> Duration {
        Duration::from_millis(self.quiesce_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.telemetry.ring_capacity, 50);
        assert_eq!(config.flash.max_chunk_retries, 10);
        assert_eq!(config.text.max_discards, 5);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SessionConfig::from_json(
            r#"{ "read_timeout_ms": 250, "telemetry": { "short_window": 3 } }"#,
        )
        .unwrap();
        assert_eq!(config.read_timeout_ms, 250);
        assert_eq!(config.telemetry.short_window, 3);
        assert_eq!(config.telemetry.long_window, 25);
        assert_eq!(config.watchdog.quiet_period_ms, 30_000);
    }

    #[test]
    fn test_invalid_windows_rejected() {
        let err = SessionConfig::from_json(r#"{ "telemetry": { "short_window": 40 } }"#);
        assert!(matches!(err, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let mut config = SessionConfig::default();
        config.correlator.poll_interval_ms = 5;
        config.save(&path).unwrap();
        assert_eq!(SessionConfig::load(&path).unwrap(), config);
    }
}
