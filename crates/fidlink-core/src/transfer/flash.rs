//! Chunked flash transfer
//!
//! Writes go chunk by chunk: write, wait for the acknowledgement, read the
//! same range back and compare. A chunk that fails is retried as a whole
//! with a fixed backoff; once the retry budget is gone the transfer fails.
//! Reads are the same loop without the verify step.

use byteorder::{ByteOrder, LittleEndian};
use std::thread;

use crate::config::FlashConfig;
use crate::protocol::ProtocolError;
use crate::session::{EventBus, SessionEvent};

/// Largest value accepted for a stored length prefix
pub const MAX_STORED_LENGTH: u32 = 100_000;

/// Size of the stored length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Reject ranges that run past the 32-bit flash address space
fn check_range(address: u32, length: usize) -> Result<(), ProtocolError> {
    let end = u64::from(address) + length as u64;
    if end > u64::from(u32::MAX) + 1 {
        return Err(ProtocolError::InvalidRequest(format!(
            "{length} bytes at {address:#010x} run past the end of flash"
        )));
    }
    Ok(())
}

/// Chunk-level access to device flash
pub trait FlashAccess {
    /// Bytes per chunk for this wire format
    fn chunk_size(&self) -> usize;

    /// Write one chunk and wait for the device to acknowledge it
    fn write_chunk(&self, address: u32, data: &[u8]) -> Result<(), ProtocolError>;

    /// Read one chunk of exactly `length` bytes
    fn read_chunk(&self, address: u32, length: usize) -> Result<Vec<u8>, ProtocolError>;
}

/// Outcome of a completed transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferReport {
    pub bytes: usize,
    pub chunks: usize,
    /// Chunk attempts repeated after a failure
    pub retries: u32,
}

/// One flash transfer over a [`FlashAccess`]
pub struct FlashTransfer<'a, A: FlashAccess + ?Sized> {
    access: &'a A,
    config: FlashConfig,
    events: Option<EventBus>,
    progress: Option<Box<dyn FnMut(u8) + 'a>>,
}

impl<'a, A: FlashAccess + ?Sized> FlashTransfer<'a, A> {
    pub fn new(access: &'a A, config: FlashConfig) -> Self {
        Self {
            access,
            config,
            events: None,
            progress: None,
        }
    }

    /// Publish progress and completion on `events`
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Call `callback` with the percentage after every chunk
    pub fn on_progress(mut self, callback: impl FnMut(u8) + 'a) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    fn report(&mut self, percent: u8) {
        if let Some(callback) = self.progress.as_mut() {
            callback(percent);
        }
        if let Some(events) = &self.events {
            events.publish(SessionEvent::FlashProgress(percent));
        }
    }

    fn finish(&mut self) {
        self.report(100);
        if let Some(events) = &self.events {
            events.publish(SessionEvent::FlashDone);
        }
    }

    /// Run `attempt` until it succeeds, fails fatally or the budget runs out
    fn with_retries<T>(
        &self,
        address: u32,
        retries: &mut u32,
        mut attempt: impl FnMut() -> Result<T, ProtocolError>,
    ) -> Result<T, ProtocolError> {
        let mut tries = 0u32;
        loop {
            match attempt() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && tries < self.config.max_chunk_retries => {
                    tries += 1;
                    *retries += 1;
                    tracing::warn!(address = %format!("{address:#010x}"), tries, "chunk failed: {e}");
                    thread::sleep(self.config.retry_backoff());
                }
                Err(ProtocolError::VerifyMismatch { address, .. }) => {
                    return Err(ProtocolError::VerifyMismatch {
                        address,
                        attempts: tries + 1,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write `data` starting at `address`, verifying every chunk
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<TransferReport, ProtocolError> {
        check_range(address, data.len())?;
        let chunk_size = self.access.chunk_size();
        let total = data.len();
        let mut report = TransferReport {
            bytes: total,
            ..Default::default()
        };

        let mut offset = 0;
        while offset < total {
            let len = chunk_size.min(total - offset);
            let chunk = &data[offset..offset + len];
            let chunk_address = address + offset as u32;
            let access = self.access;

            self.with_retries(chunk_address, &mut report.retries, || {
                access.write_chunk(chunk_address, chunk)?;
                let readback = access.read_chunk(chunk_address, len)?;
                if readback != chunk {
                    return Err(ProtocolError::VerifyMismatch {
                        address: chunk_address,
                        attempts: 1,
                    });
                }
                Ok(())
            })?;

            offset += len;
            report.chunks += 1;
            self.report((offset * 100 / total) as u8);
        }

        self.finish();
        tracing::info!(bytes = total, chunks = report.chunks, retries = report.retries, "flash write complete");
        Ok(report)
    }

    /// Read `length` bytes starting at `address`
    pub fn read(&mut self, address: u32, length: usize) -> Result<Vec<u8>, ProtocolError> {
        check_range(address, length)?;
        let chunk_size = self.access.chunk_size();
        let mut out = Vec::with_capacity(length);
        let mut retries = 0;

        while out.len() < length {
            let len = chunk_size.min(length - out.len());
            let chunk_address = address + out.len() as u32;
            let access = self.access;
            let chunk = self.with_retries(chunk_address, &mut retries, || {
                let chunk = access.read_chunk(chunk_address, len)?;
                if chunk.len() != len {
                    return Err(ProtocolError::Framing(format!(
                        "asked for {len} bytes at {chunk_address:#010x}, got {}",
                        chunk.len()
                    )));
                }
                Ok(chunk)
            })?;
            out.extend_from_slice(&chunk);
            self.report((out.len() * 100 / length) as u8);
        }

        self.finish();
        Ok(out)
    }

    /// Read a block stored as a 4-byte little-endian length followed by data
    pub fn read_with_stored_length(&mut self, address: u32) -> Result<Vec<u8>, ProtocolError> {
        let prefix = self.read(address, LENGTH_PREFIX_SIZE)?;
        let length = LittleEndian::read_u32(&prefix);
        if length > MAX_STORED_LENGTH {
            return Err(ProtocolError::CorruptLength(length));
        }
        if length == 0 {
            return Ok(Vec::new());
        }
        let data_address = address
            .checked_add(LENGTH_PREFIX_SIZE as u32)
            .ok_or_else(|| {
                ProtocolError::InvalidRequest(format!("no room for data after length at {address:#010x}"))
            })?;
        self.read(data_address, length as usize)
    }

    /// Write `data` behind a 4-byte little-endian length prefix
    pub fn write_with_stored_length(
        &mut self,
        address: u32,
        data: &[u8],
    ) -> Result<TransferReport, ProtocolError> {
        if data.len() > MAX_STORED_LENGTH as usize {
            return Err(ProtocolError::CorruptLength(data.len() as u32));
        }
        let mut block = vec![0u8; LENGTH_PREFIX_SIZE];
        LittleEndian::write_u32(&mut block, data.len() as u32);
        block.extend_from_slice(data);
        self.write(address, &block)
    }
}
