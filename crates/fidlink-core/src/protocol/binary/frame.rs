//! Binary frame encoding/decoding
//!
//! Frame format (all Gen1 traffic, both directions):
//! - 1 byte: sync (`0x5A`)
//! - 1 byte: total length `L`, counting sync, length, command id, body and
//!   the trailing checksum byte
//! - 1 byte: command id
//! - `L - 4` bytes: body
//! - 1 byte: rolling checksum over every preceding byte of the frame
//!
//! The checksum is `sum = rotate_left(sum, 1) + byte`, seeded with `0xD5`.

use std::time::Instant;

use crate::protocol::{Decoded, ProtocolError};

/// First byte of every frame
pub const SYNC_BYTE: u8 = 0x5A;

/// Seed of the rolling checksum
pub const CHECKSUM_SEED: u8 = 0xD5;

/// Sync + length + command id
pub const HEADER_LENGTH: usize = 3;

/// Shortest frame the decoder accepts: a header plus its checksum
pub const MIN_FRAME_LENGTH: usize = HEADER_LENGTH + 1;

/// Largest body that still fits the one-byte length field
pub const MAX_BODY_LENGTH: usize = u8::MAX as usize - MIN_FRAME_LENGTH;

/// Rolling checksum over `bytes`
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(CHECKSUM_SEED, |sum, b| sum.rotate_left(1).wrapping_add(*b))
}

/// Fill in the header of `buffer` in place and return the frame checksum.
///
/// `buffer` holds `HEADER_LENGTH` reserved bytes followed by the body. The
/// length field is the buffer size plus one for the checksum byte, which the
/// caller may or may not transmit.
pub fn encode_in_place(command_id: u8, buffer: &mut [u8]) -> Result<u8, ProtocolError> {
    if buffer.len() < HEADER_LENGTH {
        return Err(ProtocolError::Framing(format!(
            "buffer of {} bytes has no room for a header",
            buffer.len()
        )));
    }
    let body_len = buffer.len() - HEADER_LENGTH;
    if body_len > MAX_BODY_LENGTH {
        return Err(ProtocolError::Framing(format!(
            "body of {} bytes exceeds the {} byte limit",
            body_len, MAX_BODY_LENGTH
        )));
    }

    buffer[0] = SYNC_BYTE;
    buffer[1] = (buffer.len() + 1) as u8;
    buffer[2] = command_id;
    Ok(checksum(buffer))
}

/// A command on its way to the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFrame {
    pub command_id: u8,
    pub payload: Vec<u8>,
    pub append_checksum: bool,
}

impl OutgoingFrame {
    /// Create a frame that carries its checksum
    pub fn new(command_id: u8, payload: Vec<u8>) -> Self {
        Self {
            command_id,
            payload,
            append_checksum: true,
        }
    }

    /// Leave the checksum byte off the wire (some bootloader commands)
    pub fn without_checksum(mut self) -> Self {
        self.append_checksum = false;
        self
    }

    /// Encode into header+body and the separately written checksum byte
    pub fn encode(&self) -> Result<EncodedFrame, ProtocolError> {
        let mut bytes = Vec::with_capacity(HEADER_LENGTH + self.payload.len() + 1);
        bytes.resize(HEADER_LENGTH, 0);
        bytes.extend_from_slice(&self.payload);
        let sum = encode_in_place(self.command_id, &mut bytes)?;
        Ok(EncodedFrame {
            bytes,
            checksum: self.append_checksum.then_some(sum),
        })
    }
}

/// Output of [`OutgoingFrame::encode`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    /// Header and body
    pub bytes: Vec<u8>,
    /// Trailing checksum, if it is to be transmitted
    pub checksum: Option<u8>,
}

impl EncodedFrame {
    /// Everything that goes on the wire, in order
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = self.bytes.clone();
        out.extend(self.checksum);
        out
    }
}

/// A complete frame received from the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingFrame {
    pub command_id: u8,
    pub payload: Vec<u8>,
    pub received_at: Instant,
}

/// Decoder state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    WaitSync,
    WaitLength,
    WaitCommandId,
    WaitData,
}

/// Running totals kept by the decoder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub frames: u64,
    pub discarded_bytes: u64,
    pub corrupt_lengths: u64,
    pub checksum_failures: u64,
}

/// Byte-at-a-time frame decoder
///
/// Garbage between frames is skipped until the next sync byte. A corrupt
/// length or checksum drops the candidate frame, and every byte buffered
/// after its false sync byte is fed through the decoder again, so a real
/// frame hidden behind a stray `0x5A` is still found.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    expected_len: usize,
    buffer: Vec<u8>,
    stats: DecoderStats,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::WaitSync,
            expected_len: 0,
            buffer: Vec::with_capacity(u8::MAX as usize),
            stats: DecoderStats::default(),
        }
    }

    /// Current state
    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// True when no frame is partially assembled
    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::WaitSync
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Drop any partially assembled frame
    pub fn reset(&mut self) {
        self.state = DecodeState::WaitSync;
        self.expected_len = 0;
        self.buffer.clear();
    }

    /// Feed one byte and collect whatever it completes.
    ///
    /// Usually empty or a single item. A dropped frame shows up as
    /// [`Decoded::Discarded`] carrying the dropped bytes in hex; frames
    /// recovered from its buffered bytes follow it in order.
    pub fn push(&mut self, byte: u8) -> Vec<Decoded<IncomingFrame>> {
        let mut out = Vec::new();
        self.step(byte, &mut out);
        out
    }

    /// Give up on a partially assembled frame after the line went quiet.
    ///
    /// A stray sync byte with a large length would otherwise hold back the
    /// frames behind it until enough bytes arrived to fill it. The buffered
    /// bytes after the sync byte are rescanned.
    pub fn flush_stale(&mut self) -> Vec<Decoded<IncomingFrame>> {
        let mut out = Vec::new();
        if self.is_idle() {
            return out;
        }
        self.stats.discarded_bytes += 1;
        let dropped = std::mem::take(&mut self.buffer);
        out.push(Decoded::Discarded {
            raw: hex::encode_upper(&dropped),
            reason: format!(
                "incomplete frame, {} of {} bytes",
                dropped.len(),
                self.expected_len.max(dropped.len())
            ),
        });
        self.reset();
        for b in &dropped[1..] {
            self.step(*b, &mut out);
        }
        out
    }

    fn step(&mut self, byte: u8, out: &mut Vec<Decoded<IncomingFrame>>) {
        match self.state {
            DecodeState::WaitSync => {
                if byte == SYNC_BYTE {
                    self.buffer.clear();
                    self.buffer.push(byte);
                    self.state = DecodeState::WaitLength;
                } else {
                    self.stats.discarded_bytes += 1;
                }
            }
            DecodeState::WaitLength => {
                let len = byte as usize;
                if len < MIN_FRAME_LENGTH {
                    // The length byte can't be a sync byte, nothing to rescan
                    self.stats.corrupt_lengths += 1;
                    self.stats.discarded_bytes += 2;
                    self.buffer.push(byte);
                    out.push(Decoded::Discarded {
                        raw: hex::encode_upper(&self.buffer),
                        reason: format!("corrupt length byte {len}"),
                    });
                    self.reset();
                    return;
                }
                self.expected_len = len;
                self.buffer.push(byte);
                self.state = DecodeState::WaitCommandId;
            }
            DecodeState::WaitCommandId => {
                self.buffer.push(byte);
                self.state = DecodeState::WaitData;
            }
            DecodeState::WaitData => {
                self.buffer.push(byte);
                if self.buffer.len() >= self.expected_len {
                    self.complete(out);
                }
            }
        }
    }

    fn complete(&mut self, out: &mut Vec<Decoded<IncomingFrame>>) {
        let len = self.buffer.len();
        let expected = checksum(&self.buffer[..len - 1]);
        let actual = self.buffer[len - 1];
        let command_id = self.buffer[2];

        if expected != actual {
            self.stats.checksum_failures += 1;
            self.stats.discarded_bytes += 1;
            let dropped = std::mem::take(&mut self.buffer);
            out.push(Decoded::Discarded {
                raw: hex::encode_upper(&dropped),
                reason: format!(
                    "checksum mismatch on command {command_id:#04x}: expected {expected:#04x}, got {actual:#04x}"
                ),
            });
            self.reset();
            for b in &dropped[1..] {
                self.step(*b, out);
            }
            return;
        }

        out.push(Decoded::Message(IncomingFrame {
            command_id,
            payload: self.buffer[HEADER_LENGTH..len - 1].to_vec(),
            received_at: Instant::now(),
        }));
        self.stats.frames += 1;
        self.reset();
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode every complete frame in `bytes`, skipping anything malformed
pub fn decode_all(bytes: &[u8]) -> Vec<IncomingFrame> {
    let mut decoder = FrameDecoder::new();
    bytes
        .iter()
        .flat_map(|b| decoder.push(*b))
        .filter_map(|d| match d {
            Decoded::Message(frame) => Some(frame),
            Decoded::Discarded { .. } => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn wire(cmd: u8, payload: &[u8]) -> Vec<u8> {
        OutgoingFrame::new(cmd, payload.to_vec())
            .encode()
            .unwrap()
            .to_vec()
    }

    #[test]
    fn test_header_layout() {
        let bytes = wire(0x25, &[1, 2, 3]);
        assert_eq!(bytes[0], SYNC_BYTE);
        assert_eq!(bytes[1] as usize, bytes.len());
        assert_eq!(bytes[2], 0x25);
        assert_eq!(&bytes[3..6], &[1, 2, 3]);
        assert_eq!(bytes[6], checksum(&bytes[..6]));
    }

    #[test]
    fn test_roundtrip_every_payload_length() {
        for len in 0..=250usize {
            let payload: Vec<u8> = (0..len).map(|i| (i * 7 + len) as u8).collect();
            let frames = decode_all(&wire(0x1E, &payload));
            assert_eq!(frames.len(), 1, "length {len}");
            assert_eq!(frames[0].command_id, 0x1E);
            assert_eq!(frames[0].payload, payload);
        }
    }

    #[test]
    fn test_oversized_body_rejected() {
        let frame = OutgoingFrame::new(0x1F, vec![0; MAX_BODY_LENGTH + 1]);
        assert!(frame.encode().is_err());
        let frame = OutgoingFrame::new(0x1F, vec![0; MAX_BODY_LENGTH]);
        assert!(frame.encode().is_ok());
    }

    #[test]
    fn test_checksum_is_order_sensitive() {
        assert_eq!(checksum(&[1, 2, 3]), checksum(&[1, 2, 3]));
        assert_ne!(checksum(&[1, 2]), checksum(&[2, 1]));
    }

    #[test]
    fn test_checksum_detects_any_single_byte_change() {
        let base: Vec<u8> = (0..32u8).collect();
        let reference = checksum(&base);
        for i in 0..base.len() {
            for v in 0..=255u8 {
                if v == base[i] {
                    continue;
                }
                let mut changed = base.clone();
                changed[i] = v;
                assert_ne!(checksum(&changed), reference, "byte {i} -> {v}");
            }
        }
    }

    #[test]
    fn test_frame_in_noise_is_recovered() {
        let mut rng = rand::thread_rng();
        let noise = |rng: &mut rand::rngs::ThreadRng| -> Vec<u8> {
            (0..rng.gen_range(0..64))
                .map(|_| rng.gen())
                .filter(|b| *b != SYNC_BYTE)
                .collect()
        };
        for _ in 0..50 {
            let payload: Vec<u8> = (0..rng.gen_range(0..40)).map(|_| rng.gen()).collect();
            let mut stream = noise(&mut rng);
            stream.extend(wire(0x25, &payload));
            stream.extend(noise(&mut rng));

            let frames = decode_all(&stream);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].payload, payload);
        }
    }

    #[test]
    fn test_false_sync_of_any_length_is_rescanned() {
        let frame = wire(0x25, &[1, 2, 3]);
        for len in MIN_FRAME_LENGTH..=u8::MAX as usize {
            let mut stream = vec![SYNC_BYTE, len as u8, 0x33];
            stream.extend(&frame);
            stream.extend(vec![0x00; 260]);
            // A false frame whose checksum happens to match is a real frame
            let candidate = &stream[..len];
            if checksum(&candidate[..len - 1]) == candidate[len - 1] {
                continue;
            }

            let frames = decode_all(&stream);
            assert_eq!(frames.len(), 1, "false length {len}");
            assert_eq!(frames[0].payload, vec![1, 2, 3]);
        }
    }

    #[test]
    fn test_stray_sync_does_not_swallow_next_frame() {
        let mut stream = vec![0x11, SYNC_BYTE, 0x20, 0x33];
        stream.extend(wire(0x25, &[1, 2, 3]));
        stream.extend(vec![0x44; 40]);

        let frames = decode_all(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command_id, 0x25);
        assert_eq!(frames[0].payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_quiet_line_flushes_partial_frame() {
        let mut decoder = FrameDecoder::new();
        let mut stream = vec![SYNC_BYTE, 0x40, 0x33];
        stream.extend(wire(0x01, &[]));
        let out: Vec<_> = stream.iter().flat_map(|b| decoder.push(*b)).collect();
        assert!(out.is_empty());
        assert!(!decoder.is_idle());

        let out = decoder.flush_stale();
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], Decoded::Discarded { .. }));
        assert!(matches!(&out[1], Decoded::Message(f) if f.command_id == 0x01));
        assert!(decoder.is_idle());
        assert!(decoder.flush_stale().is_empty());
    }

    #[test]
    fn test_discard_reports_dropped_bytes() {
        let mut bad = wire(0x25, &[9, 9, 9]);
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;

        let mut decoder = FrameDecoder::new();
        let out: Vec<_> = bad.iter().flat_map(|b| decoder.push(*b)).collect();
        assert_eq!(out.len(), 1);
        match &out[0] {
            Decoded::Discarded { raw, .. } => assert_eq!(*raw, hex::encode_upper(&bad)),
            other => panic!("expected a discard, got {other:?}"),
        }
    }

    #[test]
    fn test_short_length_resets_decoder() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(SYNC_BYTE).is_empty());
        assert!(matches!(
            decoder.push(2).as_slice(),
            [Decoded::Discarded { .. }]
        ));
        assert!(decoder.is_idle());

        let out: Vec<_> = wire(0x01, &[]).iter().flat_map(|b| decoder.push(*b)).collect();
        assert!(matches!(out.as_slice(), [Decoded::Message(f)] if f.payload.is_empty()));
        assert_eq!(decoder.stats().corrupt_lengths, 1);
    }

    #[test]
    fn test_bad_checksum_dropped_then_next_frame_decodes() {
        let mut bad = wire(0x25, &[9, 9, 9]);
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        let mut stream = bad;
        stream.extend(wire(0x25, &[1]));

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        let mut errors = 0;
        for b in stream {
            for decoded in decoder.push(b) {
                match decoded {
                    Decoded::Message(f) => frames.push(f),
                    Decoded::Discarded { .. } => errors += 1,
                }
            }
        }
        assert_eq!(errors, 1);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, vec![1]);
    }

    #[test]
    fn test_missing_checksum_option() {
        let encoded = OutgoingFrame::new(0x3D, vec![1, 2, 3, 4])
            .without_checksum()
            .encode()
            .unwrap();
        assert!(encoded.checksum.is_none());
        assert_eq!(encoded.bytes[1] as usize, encoded.bytes.len() + 1);
    }
}
