//! Protocol errors

use thiserror::Error;

/// Errors that can occur while talking to an analyzer
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// Malformed or garbage bytes on the link. The codecs recover from these
    /// locally; callers only see one when a bounded resync gave up.
    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Timed out after {waited_ms}ms waiting for {expected}")]
    CorrelationTimeout { expected: String, waited_ms: u64 },

    #[error("Device reported error {code} for {error_type}: {description}")]
    DeviceReported {
        error_type: String,
        code: i32,
        description: String,
    },

    #[error("Flash verify mismatch at {address:#010x} after {attempts} attempts")]
    VerifyMismatch { address: u32, attempts: u32 },

    #[error("Stored length {0} is outside the valid range")]
    CorruptLength(u32),

    #[error("Invalid response from device: {0}")]
    InvalidResponse(String),

    /// Rejected on the host before anything was sent
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Firmware update failed: {0}")]
    FirmwareUpdate(String),

    /// The link is unusable and the session has to be rebuilt.
    #[error("Reconnect needed: {0}")]
    ReconnectNeeded(String),

    #[error("Session has been shut down")]
    ShutDown,

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether retrying the same operation on the same session can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProtocolError::CorrelationTimeout { .. }
                | ProtocolError::VerifyMismatch { .. }
                | ProtocolError::Framing(_)
        )
    }

    /// Whether the session must be torn down and reconnected
    pub fn is_reconnect_needed(&self) -> bool {
        matches!(
            self,
            ProtocolError::ReconnectNeeded(_) | ProtocolError::ShutDown
        )
    }

    /// Build a device-reported error, translating known codes
    pub fn device_reported(error_type: impl Into<String>, code: i32) -> Self {
        ProtocolError::DeviceReported {
            error_type: error_type.into(),
            code,
            description: describe_device_error(code).to_string(),
        }
    }
}

/// Human-readable translation of the error codes both analyzer generations report
pub fn describe_device_error(code: i32) -> &'static str {
    match code {
        1 => "unknown command",
        2 => "invalid parameter",
        3 => "not enough calibration slots",
        4 => "warm-up time not met",
        5 => "pump is not running",
        6 => "flame already lit",
        7 => "flash address out of range",
        8 => "hydrogen pressure too low",
        9 => "battery too low",
        _ => "unrecognized device error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes_are_translated() {
        let err = ProtocolError::device_reported("CALG", 3);
        assert!(err.to_string().contains("not enough calibration slots"));
        assert_eq!(describe_device_error(4), "warm-up time not met");
        assert_eq!(describe_device_error(250), "unrecognized device error");
    }

    #[test]
    fn test_classification() {
        let timeout = ProtocolError::CorrelationTimeout {
            expected: "RDNG".into(),
            waited_ms: 500,
        };
        assert!(timeout.is_retryable());
        assert!(!timeout.is_reconnect_needed());

        let fatal = ProtocolError::ReconnectNeeded("link quiet".into());
        assert!(fatal.is_reconnect_needed());
        assert!(!fatal.is_retryable());

        assert!(!ProtocolError::CorruptLength(200_000).is_retryable());
    }
}
