//! Gen2 text protocol

pub mod decoder;
pub mod message;
pub mod payloads;

pub use decoder::{LineDecoder, LineDecoderStats};
pub use message::{parse_line, MessageType, TextMessage, TERMINATOR};
pub use payloads::{BatteryStatus, DriveLevels};

use super::{CommunicationChannel, Decoded, Dispatch, ProtocolError, WireProtocol};
use crate::config::TextCodecConfig;

/// Prefix the host puts on every line it sends
pub const HOST_PREFIX: &str = "ZUzu";

/// Text that closes a multi-line `LOGR` reply
pub const LOG_END_MARKER: &str = "END";

/// CRLF line framing over a byte stream
#[derive(Debug, Clone)]
pub struct TextProtocol {
    host_prefix: String,
    max_line_length: usize,
}

impl TextProtocol {
    pub fn new(config: &TextCodecConfig) -> Self {
        Self {
            host_prefix: config.host_prefix.clone(),
            max_line_length: config.max_line_length,
        }
    }

    pub fn host_prefix(&self) -> &str {
        &self.host_prefix
    }

    /// Whether `msg` closes a bulk log reply
    pub fn is_log_end(msg: &TextMessage) -> bool {
        msg.msg_type == MessageType::Logr && msg.unparsed.trim() == LOG_END_MARKER
    }
}

impl Default for TextProtocol {
    fn default() -> Self {
        Self::new(&TextCodecConfig::default())
    }
}

impl WireProtocol for TextProtocol {
    type Outgoing = TextMessage;
    type Incoming = TextMessage;
    type Key = MessageType;
    type Decoder = LineDecoder;

    fn name(&self) -> &'static str {
        "text"
    }

    fn decoder(&self) -> LineDecoder {
        LineDecoder::new(self.max_line_length)
    }

    fn push_byte(&self, decoder: &mut LineDecoder, byte: u8) -> Vec<Decoded<TextMessage>> {
        decoder.push(byte).into_iter().collect()
    }

    fn decoder_idle(&self, decoder: &LineDecoder) -> bool {
        decoder.is_idle()
    }

    fn reset_decoder(&self, decoder: &mut LineDecoder) {
        decoder.reset();
    }

    fn write(
        &self,
        message: &TextMessage,
        channel: &mut dyn CommunicationChannel,
    ) -> Result<(), ProtocolError> {
        let line = message.encode(&self.host_prefix);
        channel.write_segment(line.as_bytes(), 0, line.len())?;
        Ok(())
    }

    fn request_key(&self, message: &TextMessage) -> MessageType {
        message.msg_type
    }

    fn response_key(&self, message: &TextMessage) -> MessageType {
        message.msg_type
    }

    fn classify(&self, message: &TextMessage) -> Dispatch<MessageType> {
        match message.msg_type {
            MessageType::Errr => match payloads::error_report(message) {
                Ok((error_type, code)) => match error_type.parse::<MessageType>() {
                    Ok(key) => Dispatch::DeviceError { key, code },
                    Err(_) => {
                        tracing::warn!("device error {code} for unknown type '{error_type}'");
                        Dispatch::Response
                    }
                },
                Err(e) => {
                    tracing::warn!("malformed error report '{}': {e}", message.raw);
                    Dispatch::Response
                }
            },
            MessageType::Shut => {
                Dispatch::Shutdown(message.get("reason").unwrap_or("unspecified").to_string())
            }
            MessageType::Logr => Dispatch::Bulk,
            _ => Dispatch::Response,
        }
    }

    fn key_name(&self, key: MessageType) -> String {
        key.as_str().to_string()
    }

    fn ping(&self) -> TextMessage {
        TextMessage::new(MessageType::Ping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        let p = TextProtocol::default();
        let err = parse_line("ZUzu ERRR type=CALG,code=3").unwrap();
        assert_eq!(
            p.classify(&err),
            Dispatch::DeviceError {
                key: MessageType::Calg,
                code: 3
            }
        );
        let shut = parse_line("ZUzu SHUT reason=battery").unwrap();
        assert_eq!(p.classify(&shut), Dispatch::Shutdown("battery".into()));
        let log = parse_line("ZUzu LOGR 00ff").unwrap();
        assert_eq!(p.classify(&log), Dispatch::Bulk);
        assert!(!TextProtocol::is_log_end(&log));
        assert!(TextProtocol::is_log_end(&parse_line("ZUzu LOGR END").unwrap()));
    }
}
