//! Firmware update over the bootloader's raw block protocol
//!
//! Once the device accepts the update-mode command it stops speaking either
//! framed protocol. The exchange is:
//!
//! ```text
//! device: READY
//! host:   BLCK <4096 bytes>     (per block)
//! device: ACKB                  (anything else: host sends RSTR, device RSTA,
//!                                transfer restarts at block 0)
//! host:   DONE
//! device: done
//! ```

use std::time::Duration;

use crate::config::FirmwareConfig;
use crate::device::poller::TelemetryPoller;
use crate::protocol::{ProtocolError, WireProtocol};
use crate::session::{Session, SessionEvent};

pub const BLOCK_SIZE: usize = 4096;
pub const PAD_BYTE: u8 = 0xFF;

pub const READY_MARKER: &[u8; 5] = b"READY";
pub const BLOCK_MARKER: &[u8; 4] = b"BLCK";
pub const BLOCK_ACK: &[u8; 4] = b"ACKB";
pub const RESTART: &[u8; 4] = b"RSTR";
pub const RESTART_ACK: &[u8; 4] = b"RSTA";
pub const TERMINATE: &[u8; 4] = b"DONE";
pub const TERMINATE_ECHO: &[u8; 4] = b"done";

/// Pad `image` with `PAD_BYTE` to a whole number of blocks
pub fn pad_image(image: &[u8]) -> Vec<u8> {
    let blocks = image.len().div_ceil(BLOCK_SIZE);
    let mut padded = image.to_vec();
    padded.resize(blocks * BLOCK_SIZE, PAD_BYTE);
    padded
}

/// Outcome of a successful update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateReport {
    pub blocks: usize,
    pub restarts: u32,
}

/// Drives one firmware update on a session
pub struct FirmwareUpdater<'a, P: WireProtocol> {
    session: &'a Session<P>,
    config: FirmwareConfig,
    poller: Option<&'a TelemetryPoller>,
    progress: Option<Box<dyn FnMut(u8) + 'a>>,
}

impl<'a, P: WireProtocol> FirmwareUpdater<'a, P> {
    pub fn new(session: &'a Session<P>, config: FirmwareConfig) -> Self {
        Self {
            session,
            config,
            poller: None,
            progress: None,
        }
    }

    /// Telemetry poller to pause for the duration of the update
    pub fn pausing(mut self, poller: Option<&'a TelemetryPoller>) -> Self {
        self.poller = poller;
        self
    }

    pub fn on_progress(mut self, callback: impl FnMut(u8) + 'a) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    fn report(&mut self, percent: u8) {
        if let Some(callback) = self.progress.as_mut() {
            callback(percent);
        }
        self.session
            .events()
            .publish(SessionEvent::FirmwareProgress(percent));
    }

    /// Run the update. `enter_update_mode` is the password-gated command
    /// that switches the device to its bootloader.
    ///
    /// Normal operation is restored whether or not the update succeeds.
    pub fn run(
        mut self,
        enter_update_mode: P::Outgoing,
        image: &[u8],
    ) -> Result<UpdateReport, ProtocolError> {
        if image.is_empty() {
            return Err(ProtocolError::FirmwareUpdate("empty image".into()));
        }
        let padded = pad_image(image);

        if let Some(poller) = self.poller {
            poller.pause();
            if !poller.wait_paused(self.config.quiesce()) {
                tracing::warn!("telemetry still busy after {:?}", self.config.quiesce());
            }
        }

        let result = self
            .session
            .enter_raw_mode(self.config.quiesce())
            .and_then(|()| self.transfer(enter_update_mode, &padded));

        self.session.exit_raw_mode();
        if let Some(poller) = self.poller {
            poller.resume();
        }

        match &result {
            Ok(report) => {
                tracing::info!(blocks = report.blocks, restarts = report.restarts, "firmware update complete");
                self.session.events().publish(SessionEvent::FirmwareDone);
            }
            Err(e) => tracing::error!("firmware update failed: {e}"),
        }
        result
    }

    fn expect_token(&self, expected: &[u8; 4], timeout: Duration) -> Result<bool, ProtocolError> {
        let token = self
            .session
            .read_raw_exact(4, timeout, self.config.poll_interval())?;
        if token.as_slice() != expected {
            tracing::warn!(
                "expected {:?}, got {:?}",
                String::from_utf8_lossy(expected),
                String::from_utf8_lossy(&token)
            );
            return Ok(false);
        }
        Ok(true)
    }

    fn transfer(&mut self, enter_update_mode: P::Outgoing, image: &[u8]) -> Result<UpdateReport, ProtocolError> {
        self.session.correlator().send(enter_update_mode)?;
        self.session.wait_for_raw_marker(
            READY_MARKER,
            self.config.ready_timeout(),
            self.config.poll_interval(),
        )?;
        tracing::info!(bytes = image.len(), "bootloader ready");

        let blocks: Vec<&[u8]> = image.chunks(BLOCK_SIZE).collect();
        let total = blocks.len();
        let mut restarts = 0u32;
        let mut index = 0;
        self.report(0);

        while index < total {
            let mut frame = Vec::with_capacity(BLOCK_MARKER.len() + BLOCK_SIZE);
            frame.extend_from_slice(BLOCK_MARKER);
            frame.extend_from_slice(blocks[index]);
            self.session.write_raw(frame)?;

            if self.expect_token(BLOCK_ACK, self.config.ack_timeout())? {
                index += 1;
                self.report((index * 100 / total) as u8);
                continue;
            }

            restarts += 1;
            if restarts > self.config.max_restarts {
                return Err(ProtocolError::FirmwareUpdate(format!(
                    "block {index} rejected after {} restarts",
                    self.config.max_restarts
                )));
            }
            tracing::warn!(block = index, restarts, "bad block acknowledgement, restarting transfer");
            self.session.write_raw(RESTART.to_vec())?;
            if !self.expect_token(RESTART_ACK, self.config.ack_timeout())? {
                return Err(ProtocolError::FirmwareUpdate(
                    "device did not acknowledge restart".into(),
                ));
            }
            index = 0;
            self.report(0);
        }

        self.session.write_raw(TERMINATE.to_vec())?;
        if !self.expect_token(TERMINATE_ECHO, self.config.ack_timeout())? {
            return Err(ProtocolError::FirmwareUpdate(
                "device did not confirm end of transfer".into(),
            ));
        }

        Ok(UpdateReport {
            blocks: total,
            restarts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding() {
        let padded = pad_image(&[1, 2, 3]);
        assert_eq!(padded.len(), BLOCK_SIZE);
        assert_eq!(&padded[..3], &[1, 2, 3]);
        assert!(padded[3..].iter().all(|b| *b == PAD_BYTE));

        assert_eq!(pad_image(&vec![0; BLOCK_SIZE]).len(), BLOCK_SIZE);
        assert_eq!(pad_image(&vec![0; BLOCK_SIZE + 1]).len(), 2 * BLOCK_SIZE);
    }
}
