//! Wire protocols
//!
//! Two analyzer generations speak two unrelated formats over the same kind
//! of byte stream:
//! - Gen1: binary frames (sync, length, command id, body, rolling checksum)
//! - Gen2: CRLF-terminated text lines (`PREFIX TYPE k=v,k=v UNPARSED`)
//!
//! [`WireProtocol`] is the seam the session engine is generic over: it owns
//! a streaming decoder, knows how to put one outbound unit on the wire, and
//! decides where each inbound unit is routed.

pub mod binary;
mod error;
pub mod serial;
pub mod stream;
pub mod text;

use std::fmt;
use std::hash::Hash;

pub use error::{describe_device_error, ProtocolError};
pub use stream::{CommunicationChannel, LinkCounters, LinkStats, MeteredChannel, TcpChannel};

/// Default baud rate for analyzer serial links
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default timeout for a request when the caller has no better number
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Result of feeding one byte to a streaming decoder
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<M> {
    /// A complete, well-formed unit
    Message(M),
    /// A unit that was dropped during resync
    Discarded { raw: String, reason: String },
}

/// Where the receive loop puts an inbound unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch<K> {
    /// Latest-wins slot for its key
    Response,
    /// Error report naming the request type that failed
    DeviceError { key: K, code: i32 },
    /// Part of a multi-message bulk reply
    Bulk,
    /// Device announced it is powering down
    Shutdown(String),
}

/// A wire format the session engine can drive
pub trait WireProtocol: Send + Sync + 'static {
    /// Unit built by callers and drained by the send loop
    type Outgoing: Clone + fmt::Debug + Send + 'static;
    /// Unit produced by the decoder
    type Incoming: Clone + fmt::Debug + Send + Sync + 'static;
    /// Correlation key (command id or message type)
    type Key: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;
    /// Streaming decoder state, owned by the receive loop
    type Decoder: Send + 'static;

    /// Short name for logs
    fn name(&self) -> &'static str;

    fn decoder(&self) -> Self::Decoder;

    /// Feed one byte to the decoder; returns every unit it completes, in order
    fn push_byte(&self, decoder: &mut Self::Decoder, byte: u8) -> Vec<Decoded<Self::Incoming>>;

    /// Called when a read timed out. A decoder may give up on a partial unit
    /// here and return what it recovers from the buffered bytes.
    fn flush_decoder(&self, _decoder: &mut Self::Decoder) -> Vec<Decoded<Self::Incoming>> {
        Vec::new()
    }

    /// True when no unit is partially assembled
    fn decoder_idle(&self, decoder: &Self::Decoder) -> bool;

    fn reset_decoder(&self, decoder: &mut Self::Decoder);

    /// Put one unit on the wire. Only the send loop calls this.
    fn write(
        &self,
        message: &Self::Outgoing,
        channel: &mut dyn CommunicationChannel,
    ) -> Result<(), ProtocolError>;

    /// Key a reply to `message` is stored under
    fn request_key(&self, message: &Self::Outgoing) -> Self::Key;

    /// Key an inbound unit is stored under
    fn response_key(&self, message: &Self::Incoming) -> Self::Key;

    fn classify(&self, message: &Self::Incoming) -> Dispatch<Self::Key>;

    /// Display name of a key, used in errors
    fn key_name(&self, key: Self::Key) -> String;

    /// Liveness probe sent by the watchdog
    fn ping(&self) -> Self::Outgoing;
}
