//! Line decoder for the Gen2 text protocol

use super::message::{parse_line, TextMessage};
use crate::protocol::Decoded;

/// Running totals kept by the decoder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineDecoderStats {
    pub messages: u64,
    pub discarded_lines: u64,
    pub overlong_lines: u64,
}

/// Byte-at-a-time CRLF line decoder
///
/// A line whose type is not in the known set is discarded and decoding
/// carries on with the next line; the receive loop bounds how many
/// consecutive discards it tolerates before resetting. Lines that never terminate are cut off at
/// `max_line_length`.
#[derive(Debug)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    max_line_length: usize,
    stats: LineDecoderStats,
}

impl LineDecoder {
    pub fn new(max_line_length: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(128),
            max_line_length,
            stats: LineDecoderStats::default(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn stats(&self) -> LineDecoderStats {
        self.stats
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Feed one byte. Returns a result when `byte` completes a line.
    pub fn push(&mut self, byte: u8) -> Option<Decoded<TextMessage>> {
        self.buffer.push(byte);

        if !self.buffer.ends_with(b"\r\n") {
            if self.buffer.len() > self.max_line_length {
                let raw = String::from_utf8_lossy(&self.buffer).into_owned();
                self.buffer.clear();
                self.stats.overlong_lines += 1;
                return Some(Decoded::Discarded {
                    raw,
                    reason: format!("no terminator within {} bytes", self.max_line_length),
                });
            }
            return None;
        }

        let line_len = self.buffer.len() - 2;
        let line = String::from_utf8_lossy(&self.buffer[..line_len]).into_owned();
        self.buffer.clear();

        if line.trim().is_empty() {
            return None;
        }

        match parse_line(&line) {
            Ok(message) => {
                self.stats.messages += 1;
                Some(Decoded::Message(message))
            }
            Err(e) => {
                self.stats.discarded_lines += 1;
                Some(Decoded::Discarded {
                    raw: line,
                    reason: e.to_string(),
                })
            }
        }
    }
}
