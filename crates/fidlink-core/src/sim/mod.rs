//! In-process simulated analyzers
//!
//! A [`SimLink`] is a [`CommunicationChannel`] whose far end is a
//! [`SimDevice`]. Every host write is handed to the device immediately and
//! whatever it answers is queued for the host to read. Devices also get a
//! `tick` on every read so they can report on their own.
//!
//! Used by the integration tests and the CLI `--demo` mode.

pub mod gen1;
pub mod gen2;

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub use gen1::Gen1Sim;
pub use gen2::Gen2Sim;

use crate::protocol::CommunicationChannel;
use crate::transfer::firmware::{
    BLOCK_ACK, BLOCK_MARKER, BLOCK_SIZE, READY_MARKER, RESTART, RESTART_ACK, TERMINATE,
    TERMINATE_ECHO,
};

/// Size of the simulated flash
pub const SIM_FLASH_SIZE: usize = 64 * 1024;

/// Password the simulators accept for update mode unless told otherwise
pub const SIM_PASSWORD: u32 = 0x4649_4431;

/// The far end of a [`SimLink`]
pub trait SimDevice: Send + 'static {
    /// Bytes written by the host; returns the device's answer
    fn receive(&mut self, bytes: &[u8]) -> Vec<u8>;

    /// Called whenever the host polls for input
    fn tick(&mut self) -> Vec<u8> {
        Vec::new()
    }
}

struct LinkState<D> {
    device: D,
    to_host: VecDeque<u8>,
    closed: bool,
}

struct Link<D> {
    state: Mutex<LinkState<D>>,
    readable: Condvar,
}

/// Host side of a simulated connection. Clones share the same device.
pub struct SimLink<D: SimDevice> {
    link: Arc<Link<D>>,
    timeout: Duration,
}

impl<D: SimDevice> Clone for SimLink<D> {
    fn clone(&self) -> Self {
        Self {
            link: Arc::clone(&self.link),
            timeout: self.timeout,
        }
    }
}

impl<D: SimDevice> SimLink<D> {
    pub fn new(device: D) -> Self {
        Self {
            link: Arc::new(Link {
                state: Mutex::new(LinkState {
                    device,
                    to_host: VecDeque::new(),
                    closed: false,
                }),
                readable: Condvar::new(),
            }),
            timeout: Duration::from_millis(100),
        }
    }

    fn state(&self) -> MutexGuard<'_, LinkState<D>> {
        self.link
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Inspect or reconfigure the device
    pub fn with_device<T>(&self, f: impl FnOnce(&mut D) -> T) -> T {
        f(&mut self.state().device)
    }

    /// Queue bytes for the host as if the device had sent them
    pub fn inject(&self, bytes: &[u8]) {
        self.state().to_host.extend(bytes);
        self.link.readable.notify_all();
    }

    /// Drop the connection; reads return end-of-stream, writes fail
    pub fn close(&self) {
        self.state().closed = true;
        self.link.readable.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

impl<D: SimDevice> Read for SimLink<D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let deadline = Instant::now() + self.timeout;
        let mut state = self.state();
        loop {
            if !state.to_host.is_empty() {
                let n = buf.len().min(state.to_host.len());
                for (slot, byte) in buf.iter_mut().zip(state.to_host.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            if state.closed {
                return Ok(0);
            }
            let ticked = state.device.tick();
            if !ticked.is_empty() {
                state.to_host.extend(ticked);
                continue;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no data from simulator"));
            }
            let wait = (deadline - now).min(Duration::from_millis(20));
            state = match self.link.readable.wait_timeout(state, wait) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

impl<D: SimDevice> Write for SimLink<D> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "simulator link closed"));
        }
        let answer = state.device.receive(buf);
        if !answer.is_empty() {
            state.to_host.extend(answer);
            self.link.readable.notify_all();
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<D: SimDevice> CommunicationChannel for SimLink<D> {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.state().to_host.clear();
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn CommunicationChannel>> {
        Ok(Box::new(self.clone()))
    }
}

/// Simulated firmware bootloader shared by both generations
#[derive(Debug, Default)]
pub struct Bootloader {
    buffer: Vec<u8>,
    /// Blocks accepted since the last restart
    pub image: Vec<u8>,
    pub restarts: u32,
    pub finished: bool,
    /// Reject the block at this index once
    reject_once: Option<usize>,
}

impl Bootloader {
    pub fn new(reject_once: Option<usize>) -> Self {
        Self {
            reject_once,
            ..Default::default()
        }
    }

    /// Announcement sent when the bootloader takes over
    pub fn ready() -> Vec<u8> {
        READY_MARKER.to_vec()
    }

    pub fn receive(&mut self, bytes: &[u8]) -> Vec<u8> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        while self.buffer.len() >= 4 && !self.finished {
            let token = &self.buffer[..4];
            if token == BLOCK_MARKER {
                if self.buffer.len() < 4 + BLOCK_SIZE {
                    break;
                }
                let block: Vec<u8> = self.buffer.drain(..4 + BLOCK_SIZE).skip(4).collect();
                let index = self.image.len() / BLOCK_SIZE;
                if self.reject_once == Some(index) {
                    self.reject_once = None;
                    out.extend_from_slice(b"NAKB");
                } else {
                    self.image.extend(block);
                    out.extend_from_slice(BLOCK_ACK);
                }
            } else if token == RESTART {
                self.buffer.drain(..4);
                self.image.clear();
                self.restarts += 1;
                out.extend_from_slice(RESTART_ACK);
            } else if token == TERMINATE {
                self.buffer.drain(..4);
                self.finished = true;
                out.extend_from_slice(TERMINATE_ECHO);
            } else {
                self.buffer.remove(0);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl SimDevice for Echo {
        fn receive(&mut self, bytes: &[u8]) -> Vec<u8> {
            bytes.to_vec()
        }
    }

    #[test]
    fn test_link_echo_and_timeout() {
        let mut link = SimLink::new(Echo);
        link.set_timeout(Duration::from_millis(30)).unwrap();
        link.write_all(b"ab").unwrap();
        assert_eq!(link.read_byte().unwrap(), Some(b'a'));
        assert_eq!(link.read_byte().unwrap(), Some(b'b'));
        assert_eq!(link.read_byte().unwrap(), None);
    }

    #[test]
    fn test_closed_link() {
        let mut link = SimLink::new(Echo);
        link.close();
        assert!(link.read_byte().is_err());
        assert!(link.write_all(b"x").is_err());
    }

    #[test]
    fn test_bootloader_restart() {
        let mut boot = Bootloader::new(Some(1));
        let mut block = BLOCK_MARKER.to_vec();
        block.extend(vec![7u8; BLOCK_SIZE]);

        assert_eq!(boot.receive(&block), BLOCK_ACK.to_vec());
        assert_eq!(boot.receive(&block), b"NAKB".to_vec());
        assert_eq!(boot.receive(RESTART), RESTART_ACK.to_vec());
        assert!(boot.image.is_empty());
        assert_eq!(boot.receive(&block), BLOCK_ACK.to_vec());
        assert_eq!(boot.receive(&block), BLOCK_ACK.to_vec());
        assert_eq!(boot.receive(TERMINATE), TERMINATE_ECHO.to_vec());
        assert!(boot.finished);
        assert_eq!(boot.image.len(), 2 * BLOCK_SIZE);
        assert_eq!(boot.restarts, 1);
    }
}
