//! # fidlink Core Library
//!
//! Host-side protocol engine for portable flame-ionization (FID) combustion
//! analyzers.

#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Binary framed protocol (Gen1) and delimited text protocol (Gen2) codecs
//! - Per-connection sessions with request/response correlation and a watchdog
//! - Chunked flash read/write/verify and firmware block transfer
//! - A telemetry pipeline: junk rejection, ignition debounce, range
//!   hysteresis, moving averages and log lines
//! - Simulated instruments of both generations
//!
//! ## Example
//!
//! ```rust,no_run
//! use fidlink_core::prelude::*;
//!
//! # fn main() -> Result<(), ProtocolError> {
//! let config = SessionConfig::default();
//! let channel = open_port("/dev/rfcomm0", None, config.read_timeout())?;
//! let analyzer = Gen2Analyzer::connect(Box::new(channel), config)?;
//! let readings = analyzer.read_readings()?;
//! println!("{} ppm", readings.raw_ppm);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod device;
pub mod protocol;
pub mod session;
pub mod sim;
pub mod sink;
pub mod telemetry;
pub mod transfer;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ConfigError, SessionConfig};
    pub use crate::device::{
        CalibrationResult, CalibrationSlot, Gen1Analyzer, Gen2Analyzer, LogTarget,
    };
    pub use crate::protocol::binary::BinaryProtocol;
    pub use crate::protocol::serial::open_port;
    pub use crate::protocol::text::TextProtocol;
    pub use crate::protocol::{
        CommunicationChannel, ProtocolError, TcpChannel, WireProtocol, DEFAULT_BAUD_RATE,
    };
    pub use crate::session::{EventBus, Session, SessionEvent};
    pub use crate::sink::{FileLogSink, LogSink, MemoryLogSink};
    pub use crate::telemetry::{Range, RawSample, TelemetrySample};
    pub use crate::transfer::{TransferReport, UpdateReport};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
