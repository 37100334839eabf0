//! Gen1 binary protocol

pub mod commands;
pub mod frame;
pub mod records;

pub use commands::{build, Command};
pub use frame::{
    checksum, decode_all, encode_in_place, DecodeState, DecoderStats, EncodedFrame, FrameDecoder,
    IncomingFrame, OutgoingFrame, CHECKSUM_SEED, HEADER_LENGTH, MAX_BODY_LENGTH,
    MIN_FRAME_LENGTH, SYNC_BYTE,
};
pub use records::{
    CalibrationRecord, DeviceErrorRecord, FlashBlock, StatusRecord, FLAG_GLOW_PLUG,
    FLAG_MAX_RANGE, FLAG_PRIMARY_PUMP, FLAG_PRIMARY_SOLENOID, FLAG_SECONDARY_PUMP,
    FLAG_SECONDARY_SOLENOID,
};

use super::{CommunicationChannel, Decoded, Dispatch, ProtocolError, WireProtocol};

/// Binary framing over a byte stream
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryProtocol;

impl BinaryProtocol {
    pub fn new() -> Self {
        Self
    }
}

impl WireProtocol for BinaryProtocol {
    type Outgoing = OutgoingFrame;
    type Incoming = IncomingFrame;
    type Key = u8;
    type Decoder = FrameDecoder;

    fn name(&self) -> &'static str {
        "binary"
    }

    fn decoder(&self) -> FrameDecoder {
        FrameDecoder::new()
    }

    fn push_byte(&self, decoder: &mut FrameDecoder, byte: u8) -> Vec<Decoded<IncomingFrame>> {
        decoder.push(byte)
    }

    fn flush_decoder(&self, decoder: &mut FrameDecoder) -> Vec<Decoded<IncomingFrame>> {
        decoder.flush_stale()
    }

    fn decoder_idle(&self, decoder: &FrameDecoder) -> bool {
        decoder.is_idle()
    }

    fn reset_decoder(&self, decoder: &mut FrameDecoder) {
        decoder.reset();
    }

    fn write(
        &self,
        message: &OutgoingFrame,
        channel: &mut dyn CommunicationChannel,
    ) -> Result<(), ProtocolError> {
        let encoded = message.encode()?;
        channel.write_segment(&encoded.bytes, 0, encoded.bytes.len())?;
        if let Some(sum) = encoded.checksum {
            channel.write_segment(&[sum], 0, 1)?;
        }
        Ok(())
    }

    fn request_key(&self, message: &OutgoingFrame) -> u8 {
        message.command_id
    }

    fn response_key(&self, message: &IncomingFrame) -> u8 {
        message.command_id
    }

    fn classify(&self, message: &IncomingFrame) -> Dispatch<u8> {
        if message.command_id != Command::DeviceError.id() {
            return Dispatch::Response;
        }
        match DeviceErrorRecord::unpack(&message.payload) {
            Ok(record) => Dispatch::DeviceError {
                key: record.failed_command,
                code: record.code as i32,
            },
            Err(e) => {
                tracing::warn!("malformed device error frame: {e}");
                Dispatch::Response
            }
        }
    }

    fn key_name(&self, key: u8) -> String {
        match Command::from_id(key) {
            Some(cmd) => cmd.name().to_string(),
            None => format!("command {key:#04x}"),
        }
    }

    fn ping(&self) -> OutgoingFrame {
        Command::AreYouThere.frame()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(cmd: u8, payload: Vec<u8>) -> IncomingFrame {
        IncomingFrame {
            command_id: cmd,
            payload,
            received_at: std::time::Instant::now(),
        }
    }

    #[test]
    fn test_classify_device_error() {
        let p = BinaryProtocol::new();
        let dispatch = p.classify(&frame(0x7F, vec![0x2D, 3]));
        assert_eq!(dispatch, Dispatch::DeviceError { key: 0x2D, code: 3 });
        assert_eq!(p.classify(&frame(0x25, vec![])), Dispatch::Response);
    }

    #[test]
    fn test_key_names() {
        let p = BinaryProtocol::new();
        assert_eq!(p.key_name(0x25), "ReadStatus");
        assert_eq!(p.key_name(0x99), "command 0x99");
    }

    #[test]
    fn test_corrupt_length_is_reported_as_discard() {
        let p = BinaryProtocol::new();
        let mut decoder = p.decoder();
        assert!(p.push_byte(&mut decoder, SYNC_BYTE).is_empty());
        assert_eq!(
            p.push_byte(&mut decoder, 1),
            vec![Decoded::Discarded {
                raw: "5A01".into(),
                reason: "corrupt length byte 1".into(),
            }]
        );
        assert!(p.decoder_idle(&decoder));
    }
}
