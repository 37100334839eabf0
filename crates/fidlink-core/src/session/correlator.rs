//! Request/response correlation
//!
//! There is no pending-request table. A request records when it was queued
//! and then polls the shared store: the first message of the expected key
//! received at or after that instant is the reply.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::{Outbound, Shared};
use crate::protocol::{ProtocolError, WireProtocol};

/// Handle for issuing requests on a session. Cheap to clone and usable from
/// any thread.
pub struct Correlator<P: WireProtocol> {
    shared: Arc<Shared<P>>,
}

impl<P: WireProtocol> Clone for Correlator<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P: WireProtocol> Correlator<P> {
    pub(crate) fn new(shared: Arc<Shared<P>>) -> Self {
        Self { shared }
    }

    pub fn protocol(&self) -> &P {
        &self.shared.protocol
    }

    /// Timeout used by [`Correlator::request`]
    pub fn default_timeout(&self) -> Duration {
        self.shared.config.correlator.default_timeout()
    }

    fn check_link(&self) -> Result<(), ProtocolError> {
        if self.shared.is_shut_down() {
            return Err(ProtocolError::ShutDown);
        }
        if self.shared.reconnect_pending() {
            let reason = self
                .shared
                .reconnect_reason()
                .unwrap_or_else(|| "link lost".to_string());
            return Err(ProtocolError::ReconnectNeeded(reason));
        }
        Ok(())
    }

    /// Queue a request without waiting. Returns the instant replies are
    /// matched against.
    pub fn send(&self, request: P::Outgoing) -> Result<Instant, ProtocolError> {
        self.check_link()?;
        let key = self.shared.protocol.request_key(&request);
        let sent_at = Instant::now();
        self.shared.enqueue(Outbound::Message(request))?;
        self.shared.record_command(self.shared.protocol.key_name(key));
        Ok(sent_at)
    }

    /// Send and wait for a reply stored under `expected`
    pub fn send_and_wait(
        &self,
        request: P::Outgoing,
        expected: P::Key,
        timeout: Duration,
    ) -> Result<P::Incoming, ProtocolError> {
        let since = self.send(request)?;
        self.wait_for(expected, since, timeout)
    }

    /// Send and wait for a reply of the request's own key
    pub fn request(&self, request: P::Outgoing, timeout: Duration) -> Result<P::Incoming, ProtocolError> {
        let expected = self.shared.protocol.request_key(&request);
        self.send_and_wait(request, expected, timeout)
    }

    /// [`Correlator::send_and_wait`], re-sent after each timeout.
    /// Other errors are returned at once.
    pub fn send_and_wait_retrying(
        &self,
        request: P::Outgoing,
        expected: P::Key,
        timeout: Duration,
        attempts: u32,
    ) -> Result<P::Incoming, ProtocolError> {
        let attempts = attempts.max(1);
        let backoff = self.shared.config.correlator.retry_backoff();
        let mut attempt = 1;
        loop {
            match self.send_and_wait(request.clone(), expected, timeout) {
                Err(e @ ProtocolError::CorrelationTimeout { .. }) if attempt < attempts => {
                    tracing::debug!(attempt, "{e}, retrying");
                    attempt += 1;
                    thread::sleep(backoff);
                }
                other => return other,
            }
        }
    }

    /// Send and collect a multi-part bulk reply.
    ///
    /// Collection stops after `limit` parts or when `is_end` matches a part
    /// (the end marker itself is not returned). A timeout with parts
    /// already collected returns them; with nothing collected it is an
    /// error.
    pub fn send_and_wait_multiple(
        &self,
        request: P::Outgoing,
        limit: Option<usize>,
        is_end: impl Fn(&P::Incoming) -> bool,
        timeout: Duration,
    ) -> Result<Vec<P::Incoming>, ProtocolError> {
        let key = self.shared.protocol.request_key(&request);
        let since = self.send(request)?;
        let poll = self.shared.config.correlator.poll_interval();
        let mut parts = Vec::new();

        loop {
            self.check_link()?;
            for stored in self.shared.store.drain_bulk_since(since) {
                if is_end(&stored.message) {
                    return Ok(parts);
                }
                parts.push(stored.message);
                if limit.is_some_and(|limit| parts.len() >= limit) {
                    return Ok(parts);
                }
            }
            if let Some(error) = self.shared.store.error_since(key, since) {
                return Err(ProtocolError::device_reported(error.error_type, error.code));
            }
            if since.elapsed() >= timeout {
                if parts.is_empty() {
                    return Err(self.timeout_error(key, timeout));
                }
                tracing::warn!(
                    parts = parts.len(),
                    "bulk reply to {} ended without an end marker",
                    self.shared.protocol.key_name(key)
                );
                return Ok(parts);
            }
            thread::sleep(poll);
        }
    }

    /// Wait for a message stored under `expected` that arrived at or after
    /// `since`
    pub fn wait_for(
        &self,
        expected: P::Key,
        since: Instant,
        timeout: Duration,
    ) -> Result<P::Incoming, ProtocolError> {
        let poll = self.shared.config.correlator.poll_interval();
        loop {
            self.check_link()?;
            if let Some(stored) = self.shared.store.take_since(expected, since) {
                return Ok(stored.message);
            }
            if let Some(error) = self.shared.store.error_since(expected, since) {
                return Err(ProtocolError::device_reported(error.error_type, error.code));
            }
            if since.elapsed() >= timeout {
                return Err(self.timeout_error(expected, timeout));
            }
            thread::sleep(poll);
        }
    }

    fn timeout_error(&self, key: P::Key, timeout: Duration) -> ProtocolError {
        ProtocolError::CorrelationTimeout {
            expected: self.shared.protocol.key_name(key),
            waited_ms: timeout.as_millis() as u64,
        }
    }
}
