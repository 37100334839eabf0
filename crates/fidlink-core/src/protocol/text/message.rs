//! Gen2 text messages
//!
//! One message per line:
//!
//! ```text
//! ZUzu RDNG PPM=12.5,PA=103.2 \r\n
//! ZUzu LOGR 0a1b2c3d\r\n
//! ```
//!
//! The first token is a sender prefix the host ignores on receipt. The
//! second is the message type, from a closed set. The remainder is either a
//! comma-separated `key=value` list followed by free text, or free text
//! only.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::protocol::ProtocolError;

/// Line terminator
pub const TERMINATOR: &[u8; 2] = b"\r\n";

/// Known Gen2 message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Sensor readings
    Rdng,
    /// Drive levels of pumps, glow plug and solenoids
    Drvl,
    /// FID readings
    Fidr,
    /// Battery status
    Bats,
    /// One calibration table entry
    Calt,
    /// Generate calibration
    Calg,
    /// Delete calibration
    Cald,
    /// Error report
    Errr,
    /// Shutdown report
    Shut,
    /// Log retrieval
    Logr,
    Ping,
    /// Periodic reporting
    Prdc,
    /// Range
    Rnge,
    /// Hardware averaging
    Avgs,
    /// Flash read
    Flrd,
    /// Flash write
    Flwr,
    /// Update mode
    Updm,
    Vers,
    /// Ignite
    Ignt,
    Pump,
}

impl MessageType {
    pub const ALL: [MessageType; 20] = [
        MessageType::Rdng,
        MessageType::Drvl,
        MessageType::Fidr,
        MessageType::Bats,
        MessageType::Calt,
        MessageType::Calg,
        MessageType::Cald,
        MessageType::Errr,
        MessageType::Shut,
        MessageType::Logr,
        MessageType::Ping,
        MessageType::Prdc,
        MessageType::Rnge,
        MessageType::Avgs,
        MessageType::Flrd,
        MessageType::Flwr,
        MessageType::Updm,
        MessageType::Vers,
        MessageType::Ignt,
        MessageType::Pump,
    ];

    /// Four-letter tag on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Rdng => "RDNG",
            MessageType::Drvl => "DRVL",
            MessageType::Fidr => "FIDR",
            MessageType::Bats => "BATS",
            MessageType::Calt => "CALT",
            MessageType::Calg => "CALG",
            MessageType::Cald => "CALD",
            MessageType::Errr => "ERRR",
            MessageType::Shut => "SHUT",
            MessageType::Logr => "LOGR",
            MessageType::Ping => "PING",
            MessageType::Prdc => "PRDC",
            MessageType::Rnge => "RNGE",
            MessageType::Avgs => "AVGS",
            MessageType::Flrd => "FLRD",
            MessageType::Flwr => "FLWR",
            MessageType::Updm => "UPDM",
            MessageType::Vers => "VERS",
            MessageType::Ignt => "IGNT",
            MessageType::Pump => "PUMP",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ProtocolError::Framing(format!("unknown message type '{s}'")))
    }
}

/// One Gen2 message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextMessage {
    pub msg_type: MessageType,
    /// Parameters in wire order
    pub params: Vec<(String, String)>,
    pub unparsed: String,
    /// The line as received, without terminator; empty for outbound messages
    pub raw: String,
}

impl TextMessage {
    pub fn new(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            params: Vec::new(),
            unparsed: String::new(),
            raw: String::new(),
        }
    }

    /// Append a parameter
    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((key.into(), value.to_string()));
        self
    }

    pub fn with_unparsed(mut self, text: impl Into<String>) -> Self {
        self.unparsed = text.into();
        self
    }

    /// Value of the first parameter named `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn required(&self, key: &str) -> Result<&str, ProtocolError> {
        self.get(key).ok_or_else(|| {
            ProtocolError::InvalidResponse(format!("{} is missing '{key}'", self.msg_type))
        })
    }

    pub fn get_f64(&self, key: &str) -> Result<f64, ProtocolError> {
        let value = self.required(key)?;
        value.trim().parse().map_err(|_| {
            ProtocolError::InvalidResponse(format!(
                "{} field '{key}' is not a number: '{value}'",
                self.msg_type
            ))
        })
    }

    pub fn get_i64(&self, key: &str) -> Result<i64, ProtocolError> {
        let value = self.required(key)?;
        value.trim().parse().map_err(|_| {
            ProtocolError::InvalidResponse(format!(
                "{} field '{key}' is not an integer: '{value}'",
                self.msg_type
            ))
        })
    }

    /// `1`/`0` flags, also accepting `true`/`false`
    pub fn get_bool(&self, key: &str) -> Result<bool, ProtocolError> {
        match self.required(key)?.trim() {
            "1" | "true" | "on" => Ok(true),
            "0" | "false" | "off" => Ok(false),
            other => Err(ProtocolError::InvalidResponse(format!(
                "{} field '{key}' is not a flag: '{other}'",
                self.msg_type
            ))),
        }
    }

    /// Encode as a wire line, terminator included
    pub fn encode(&self, prefix: &str) -> String {
        let mut line = format!("{prefix} {}", self.msg_type);
        if !self.params.is_empty() {
            let params: Vec<String> = self.params.iter().map(|(k, v)| format!("{k}={v}")).collect();
            line.push(' ');
            line.push_str(&params.join(","));
            line.push(' ');
            line.push_str(&self.unparsed);
        } else if !self.unparsed.is_empty() {
            line.push(' ');
            line.push_str(&self.unparsed);
        }
        line.push_str("\r\n");
        line
    }
}

/// Parse one line (terminator already stripped).
///
/// Fails only when the line has no type token or the type is unknown;
/// malformed individual parameters are skipped.
pub fn parse_line(line: &str) -> Result<TextMessage, ProtocolError> {
    let mut parts = line.splitn(3, ' ');
    let _prefix = parts.next();
    let type_token = parts
        .next()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ProtocolError::Framing(format!("no message type in '{line}'")))?;
    let msg_type: MessageType = type_token.trim().parse()?;
    let remainder = parts.next().unwrap_or("").trim();

    let (param_text, unparsed) = match remainder.split_once(' ') {
        Some((first, rest)) if first.contains('=') => (first, rest.trim()),
        None if remainder.contains('=') => (remainder, ""),
        _ => ("", remainder),
    };

    let mut params = Vec::new();
    for token in param_text.split(',').filter(|t| !t.is_empty()) {
        match token.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                params.push((key.to_string(), value.to_string()));
            }
            _ => tracing::debug!(msg_type = %msg_type, "skipping malformed parameter '{token}'"),
        }
    }

    Ok(TextMessage {
        msg_type,
        params,
        unparsed: unparsed.to_string(),
        raw: line.to_string(),
    })
}
