//! Byte-stream transport boundary
//!
//! The engine only needs blocking single-byte reads with a finite timeout,
//! writes, flushes and a way to get a second handle for the reader thread.
//! Serial (including Bluetooth SPP ports) and TCP adapters are provided here;
//! anything else can implement [`CommunicationChannel`] directly.

use serde::{Deserialize, Serialize};
use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Abstraction for communication channels (Serial or TCP)
pub trait CommunicationChannel: Read + Write + Send {
    /// Set timeout for read/write operations. Must be finite: the receive
    /// loop relies on reads returning so it can observe shutdown.
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Clear input buffers
    fn clear_input_buffer(&mut self) -> io::Result<()>;

    /// Try to clone the channel
    fn try_clone(&self) -> io::Result<Box<dyn CommunicationChannel>>;

    /// Read a single byte, returning `Ok(None)` when the read timed out
    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut buf = [0u8; 1];
        match self.read(&mut buf) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "transport closed",
            )),
            Ok(_) => Ok(Some(buf[0])),
            Err(ref e)
                if e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Write `length` bytes of `data` starting at `offset`
    fn write_segment(&mut self, data: &[u8], offset: usize, length: usize) -> io::Result<()> {
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "segment out of bounds"))?;
        self.write_all(&data[offset..end])
    }
}

/// Serial port wrapper implementing CommunicationChannel
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
}

impl SerialChannel {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl Read for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl CommunicationChannel for SerialChannel {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port.set_timeout(timeout).map_err(io::Error::other)
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::other)
    }

    fn try_clone(&self) -> io::Result<Box<dyn CommunicationChannel>> {
        let port_clone = self.port.try_clone().map_err(io::Error::other)?;
        Ok(Box::new(SerialChannel::new(port_clone)))
    }
}

/// TCP stream wrapper implementing CommunicationChannel
pub struct TcpChannel {
    stream: TcpStream,
}

impl TcpChannel {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Connect to an analyzer bridge listening on `addr`
    pub fn connect(addr: &str, timeout: Duration) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let mut channel = Self::new(stream);
        channel.set_timeout(timeout)?;
        Ok(channel)
    }
}

impl Read for TcpChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl CommunicationChannel for TcpChannel {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        // A zero duration is rejected by the socket API; clamp to 1ms.
        let timeout = timeout.max(Duration::from_millis(1));
        self.stream.set_read_timeout(Some(timeout))?;
        self.stream.set_write_timeout(Some(timeout))?;
        Ok(())
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        // No kernel call for this on sockets: drain whatever is queued.
        self.stream.set_nonblocking(true)?;
        let mut buf = [0u8; 1024];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    let _ = self.stream.set_nonblocking(false);
                    return Err(e);
                }
            }
        }
        self.stream.set_nonblocking(false)?;
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn CommunicationChannel>> {
        let stream_clone = self.stream.try_clone()?;
        Ok(Box::new(TcpChannel::new(stream_clone)))
    }
}

/// Byte counters shared by every handle of one connection
#[derive(Debug)]
pub struct LinkCounters {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    connected_at: Instant,
}

impl LinkCounters {
    pub fn new() -> Self {
        Self {
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            connected_at: Instant::now(),
        }
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> LinkStats {
        LinkStats {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            connected_for: self.connected_at.elapsed(),
        }
    }
}

impl Default for LinkCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time link statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub connected_for: Duration,
}

/// Channel wrapper that counts traffic in both directions
pub struct MeteredChannel {
    inner: Box<dyn CommunicationChannel>,
    counters: Arc<LinkCounters>,
}

impl MeteredChannel {
    pub fn new(inner: Box<dyn CommunicationChannel>) -> Self {
        Self {
            inner,
            counters: Arc::new(LinkCounters::new()),
        }
    }

    /// Counters shared with every clone of this channel
    pub fn counters(&self) -> Arc<LinkCounters> {
        Arc::clone(&self.counters)
    }
}

impl Read for MeteredChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.counters
            .bytes_read
            .fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

impl Write for MeteredChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.counters
            .bytes_written
            .fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl CommunicationChannel for MeteredChannel {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.inner.set_timeout(timeout)
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.inner.clear_input_buffer()
    }

    fn try_clone(&self) -> io::Result<Box<dyn CommunicationChannel>> {
        Ok(Box::new(MeteredChannel {
            inner: self.inner.try_clone()?,
            counters: Arc::clone(&self.counters),
        }))
    }
}
