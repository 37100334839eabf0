//! Serial port handling
//!
//! Bluetooth SPP links present as ordinary serial ports (`/dev/rfcomm0`,
//! `COM7`), so one opener covers both. Pairing is the operating system's job.

use std::time::Duration;

use super::stream::SerialChannel;
use super::{ProtocolError, DEFAULT_BAUD_RATE};

/// Open a serial port with the analyzer line settings (8N1, no flow control)
pub fn open_port(
    name: &str,
    baud_rate: Option<u32>,
    read_timeout: Duration,
) -> Result<SerialChannel, ProtocolError> {
    let baud = baud_rate.unwrap_or(DEFAULT_BAUD_RATE);

    let mut port = serialport::new(name, baud)
        .timeout(read_timeout)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .open()
        .map_err(|e| ProtocolError::SerialError(e.to_string()))?;

    // Some SPP bridges drop the link while DTR is low.
    if let Err(e) = port.write_data_terminal_ready(true) {
        tracing::debug!(port = name, "failed to set DTR high: {e} (continuing)");
    }

    port.clear(serialport::ClearBuffer::All)
        .map_err(|e| ProtocolError::SerialError(e.to_string()))?;

    tracing::info!(port = name, baud, "serial port opened");
    Ok(SerialChannel::new(port))
}
