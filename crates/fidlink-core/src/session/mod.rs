//! Per-connection session engine
//!
//! A [`Session`] owns three worker threads over one transport:
//! - the send loop, the only writer to the transport
//! - the receive loop, the only writer to the [`ResponseStore`]
//! - the watchdog (optional)
//!
//! Callers talk to the device through a [`Correlator`], which enqueues
//! outbound units and polls the store for replies.

pub mod correlator;
pub mod events;
mod pump;
pub mod store;
pub mod watchdog;

pub use correlator::Correlator;
pub use events::{EventBus, SessionEvent};
pub use store::{ErrorRecord, ResponseStore, Stored, HISTORY_CAPACITY};
pub use watchdog::{assess, ActivitySnapshot, WatchdogState, WatchdogVerdict};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::protocol::{
    CommunicationChannel, LinkCounters, LinkStats, MeteredChannel, ProtocolError, WireProtocol,
};

/// Sleep for `duration` in short slices, stopping early once `keep_going`
/// returns false. Returns whether the full duration elapsed.
pub(crate) fn sleep_while(duration: Duration, keep_going: impl Fn() -> bool) -> bool {
    const SLICE: Duration = Duration::from_millis(25);
    let deadline = Instant::now() + duration;
    loop {
        if !keep_going() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(SLICE.min(deadline - now));
    }
}

/// Item on the outbound queue
#[derive(Debug, Clone)]
pub(crate) enum Outbound<M> {
    Message(M),
    /// Bytes written as-is (firmware update)
    Raw(Vec<u8>),
}

/// Last command a session sent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandTrace {
    pub command: String,
    pub sent_at: DateTime<Utc>,
}

/// State shared by the session's threads and correlators
pub(crate) struct Shared<P: WireProtocol> {
    pub(crate) id: Uuid,
    pub(crate) protocol: P,
    pub(crate) config: SessionConfig,
    pub(crate) store: ResponseStore<P::Incoming, P::Key>,
    pub(crate) events: EventBus,
    counters: Arc<LinkCounters>,
    started: Instant,
    last_byte_ms: AtomicU64,
    last_parse_ms: AtomicU64,
    shutdown: AtomicBool,
    reconnect: Mutex<Option<String>>,
    reconnect_flag: AtomicBool,
    raw_requested: AtomicBool,
    raw_active: AtomicBool,
    raw_bytes: Mutex<VecDeque<u8>>,
    outbound: Mutex<Option<Sender<Outbound<P::Outgoing>>>>,
    last_command: Mutex<Option<CommandTrace>>,
    receive_running: AtomicBool,
    receiver: Mutex<Option<JoinHandle<()>>>,
    spare_reader: Mutex<Option<Box<dyn CommunicationChannel>>>,
}

impl<P: WireProtocol> Shared<P> {
    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn reconnect_pending(&self) -> bool {
        self.reconnect_flag.load(Ordering::SeqCst)
    }

    pub(crate) fn reconnect_reason(&self) -> Option<String> {
        self.reconnect.lock().ok().and_then(|r| r.clone())
    }

    /// Raise the reconnect signal. A later signal replaces an earlier one.
    pub(crate) fn signal_reconnect(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(session = %self.id, "reconnect needed: {reason}");
        if let Ok(mut slot) = self.reconnect.lock() {
            *slot = Some(reason.clone());
        }
        self.reconnect_flag.store(true, Ordering::SeqCst);
        self.events.publish(SessionEvent::ReconnectNeeded { reason });
    }

    fn millis_since_start(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub(crate) fn touch_byte(&self) {
        self.last_byte_ms
            .store(self.millis_since_start(), Ordering::Relaxed);
    }

    pub(crate) fn touch_parse(&self) {
        self.last_parse_ms
            .store(self.millis_since_start(), Ordering::Relaxed);
    }

    pub(crate) fn activity(&self) -> ActivitySnapshot {
        let now = self.millis_since_start();
        let since = |stamp: &AtomicU64| {
            Duration::from_millis(now.saturating_sub(stamp.load(Ordering::Relaxed)))
        };
        ActivitySnapshot {
            since_last_byte: since(&self.last_byte_ms),
            since_last_parse: since(&self.last_parse_ms),
            receive_running: self.receive_running.load(Ordering::SeqCst),
            raw_mode: self.raw_requested.load(Ordering::SeqCst),
        }
    }

    pub(crate) fn enqueue(&self, item: Outbound<P::Outgoing>) -> Result<(), ProtocolError> {
        let outbound = self
            .outbound
            .lock()
            .map_err(|_| ProtocolError::ShutDown)?;
        match outbound.as_ref() {
            Some(tx) => tx.send(item).map_err(|_| ProtocolError::ShutDown),
            None => Err(ProtocolError::ShutDown),
        }
    }

    pub(crate) fn record_command(&self, command: String) {
        tracing::trace!(session = %self.id, "sending {command}");
        if let Ok(mut last) = self.last_command.lock() {
            *last = Some(CommandTrace {
                command,
                sent_at: Utc::now(),
            });
        }
    }

    pub(crate) fn raw_requested(&self) -> bool {
        self.raw_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn raw_active(&self) -> bool {
        self.raw_active.load(Ordering::SeqCst)
    }

    pub(crate) fn set_raw_active(&self, active: bool) {
        self.raw_active.store(active, Ordering::SeqCst);
    }

    pub(crate) fn push_raw(&self, byte: u8) {
        if let Ok(mut raw) = self.raw_bytes.lock() {
            raw.push_back(byte);
        }
    }

    pub(crate) fn set_receive_running(&self, running: bool) {
        self.receive_running.store(running, Ordering::SeqCst);
    }

    /// Start a fresh receive loop on the spare reader. Only possible once.
    pub(crate) fn restart_receiver(self: &Arc<Self>) -> bool {
        let spare = match self.spare_reader.lock() {
            Ok(mut spare) => spare.take(),
            Err(_) => None,
        };
        let Some(reader) = spare else {
            return false;
        };
        let handle = match pump::spawn_receiver(Arc::clone(self), reader) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(session = %self.id, "failed to restart receive loop: {e}");
                return false;
            }
        };
        if let Ok(mut slot) = self.receiver.lock() {
            if let Some(old) = slot.replace(handle) {
                let _ = old.join();
            }
        }
        true
    }
}

/// A live connection to one analyzer
pub struct Session<P: WireProtocol> {
    shared: Arc<Shared<P>>,
    sender: Mutex<Option<JoinHandle<()>>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl<P: WireProtocol> Session<P> {
    /// Start the worker threads over `channel`
    pub fn connect(
        protocol: P,
        channel: Box<dyn CommunicationChannel>,
        config: SessionConfig,
    ) -> Result<Self, ProtocolError> {
        let mut writer = MeteredChannel::new(channel);
        writer.set_timeout(config.read_timeout())?;
        let counters = writer.counters();
        let reader = writer.try_clone()?;
        let spare_reader = match writer.try_clone() {
            Ok(spare) => Some(spare),
            Err(e) => {
                tracing::debug!("no spare reader, receive loop cannot be restarted: {e}");
                None
            }
        };

        let (tx, rx) = mpsc::channel();
        let id = Uuid::new_v4();
        let shared = Arc::new(Shared {
            id,
            protocol,
            store: ResponseStore::new(),
            events: EventBus::new(),
            counters,
            started: Instant::now(),
            last_byte_ms: AtomicU64::new(0),
            last_parse_ms: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            reconnect: Mutex::new(None),
            reconnect_flag: AtomicBool::new(false),
            raw_requested: AtomicBool::new(false),
            raw_active: AtomicBool::new(false),
            raw_bytes: Mutex::new(VecDeque::new()),
            outbound: Mutex::new(Some(tx)),
            last_command: Mutex::new(None),
            receive_running: AtomicBool::new(false),
            receiver: Mutex::new(None),
            spare_reader: Mutex::new(spare_reader),
            config,
        });

        let sender = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("fidlink-send-{}", short_id(&id)))
                .spawn(move || pump::send_loop(shared, Box::new(writer), rx))?
        };
        let receiver = pump::spawn_receiver(Arc::clone(&shared), reader)?;
        if let Ok(mut slot) = shared.receiver.lock() {
            *slot = Some(receiver);
        }

        let watchdog = if shared.config.watchdog.enabled {
            let shared = Arc::clone(&shared);
            Some(
                thread::Builder::new()
                    .name(format!("fidlink-watchdog-{}", short_id(&id)))
                    .spawn(move || watchdog::watchdog_loop(shared))?,
            )
        } else {
            None
        };

        tracing::info!(session = %id, protocol = shared.protocol.name(), "session started");
        Ok(Self {
            shared,
            sender: Mutex::new(Some(sender)),
            watchdog: Mutex::new(watchdog),
        })
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn protocol(&self) -> &P {
        &self.shared.protocol
    }

    pub fn correlator(&self) -> Correlator<P> {
        Correlator::new(Arc::clone(&self.shared))
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    pub fn store(&self) -> &ResponseStore<P::Incoming, P::Key> {
        &self.shared.store
    }

    pub fn link_stats(&self) -> LinkStats {
        self.shared.counters.stats()
    }

    pub fn last_command(&self) -> Option<CommandTrace> {
        self.shared.last_command.lock().ok().and_then(|c| c.clone())
    }

    /// Reason of the most recent reconnect signal, if any
    pub fn reconnect_needed(&self) -> Option<String> {
        self.shared.reconnect_reason()
    }

    pub fn signal_reconnect(&self, reason: impl Into<String>) {
        self.shared.signal_reconnect(reason);
    }

    pub fn activity(&self) -> ActivitySnapshot {
        self.shared.activity()
    }

    pub fn is_receiving(&self) -> bool {
        self.shared.receive_running.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.is_shut_down()
    }

    /// Route every received byte to the raw queue instead of the codec.
    /// Returns once the receive loop has switched over.
    pub fn enter_raw_mode(&self, timeout: Duration) -> Result<(), ProtocolError> {
        if let Ok(mut raw) = self.shared.raw_bytes.lock() {
            raw.clear();
        }
        self.shared.raw_requested.store(true, Ordering::SeqCst);
        sleep_while(timeout, || {
            !self.shared.raw_active() && !self.shared.is_shut_down()
        });
        if self.shared.raw_active() {
            tracing::debug!(session = %self.shared.id, "raw mode active");
            return Ok(());
        }
        self.shared.raw_requested.store(false, Ordering::SeqCst);
        if self.shared.is_shut_down() {
            return Err(ProtocolError::ShutDown);
        }
        Err(ProtocolError::CorrelationTimeout {
            expected: "receive loop to enter raw mode".into(),
            waited_ms: timeout.as_millis() as u64,
        })
    }

    /// Hand bytes back to the codec
    pub fn exit_raw_mode(&self) {
        self.shared.raw_requested.store(false, Ordering::SeqCst);
        if let Ok(mut raw) = self.shared.raw_bytes.lock() {
            raw.clear();
        }
        tracing::debug!(session = %self.shared.id, "raw mode released");
    }

    /// Queue bytes to be written verbatim
    pub fn write_raw(&self, bytes: Vec<u8>) -> Result<(), ProtocolError> {
        self.shared.enqueue(Outbound::Raw(bytes))
    }

    fn check_raw_link(&self) -> Result<(), ProtocolError> {
        if self.shared.is_shut_down() {
            return Err(ProtocolError::ShutDown);
        }
        if let Some(reason) = self.shared.reconnect_reason() {
            return Err(ProtocolError::ReconnectNeeded(reason));
        }
        Ok(())
    }

    /// Wait for exactly `count` raw bytes
    pub fn read_raw_exact(
        &self,
        count: usize,
        timeout: Duration,
        poll: Duration,
    ) -> Result<Vec<u8>, ProtocolError> {
        let start = Instant::now();
        loop {
            self.check_raw_link()?;
            if let Ok(mut raw) = self.shared.raw_bytes.lock() {
                if raw.len() >= count {
                    return Ok(raw.drain(..count).collect());
                }
            }
            if start.elapsed() >= timeout {
                return Err(ProtocolError::CorrelationTimeout {
                    expected: format!("{count} raw bytes"),
                    waited_ms: timeout.as_millis() as u64,
                });
            }
            thread::sleep(poll);
        }
    }

    /// Wait until `marker` appears in the raw stream, consuming it and
    /// everything before it
    pub fn wait_for_raw_marker(
        &self,
        marker: &[u8],
        timeout: Duration,
        poll: Duration,
    ) -> Result<(), ProtocolError> {
        let start = Instant::now();
        loop {
            self.check_raw_link()?;
            if let Ok(mut raw) = self.shared.raw_bytes.lock() {
                let bytes = raw.make_contiguous();
                if let Some(pos) = bytes.windows(marker.len()).position(|w| w == marker) {
                    raw.drain(..pos + marker.len());
                    return Ok(());
                }
            }
            if start.elapsed() >= timeout {
                return Err(ProtocolError::CorrelationTimeout {
                    expected: format!("raw marker {:?}", String::from_utf8_lossy(marker)),
                    waited_ms: timeout.as_millis() as u64,
                });
            }
            thread::sleep(poll);
        }
    }

    /// Stop the worker threads. The receive loop finishes any unit it is in
    /// the middle of, then the send loop drains its queue.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(session = %self.shared.id, "shutting down");

        loop {
            let handle = self.shared.receiver.lock().ok().and_then(|mut h| h.take());
            match handle {
                Some(handle) => {
                    let _ = handle.join();
                }
                None => break,
            }
        }

        if let Ok(mut outbound) = self.shared.outbound.lock() {
            outbound.take();
        }
        if let Some(handle) = self.sender.lock().ok().and_then(|mut h| h.take()) {
            let _ = handle.join();
        }
        if let Some(handle) = self.watchdog.lock().ok().and_then(|mut h| h.take()) {
            let _ = handle.join();
        }

        let stats = self.link_stats();
        tracing::info!(
            session = %self.shared.id,
            bytes_read = stats.bytes_read,
            bytes_written = stats.bytes_written,
            "session closed"
        );
    }
}

impl<P: WireProtocol> Drop for Session<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn short_id(id: &Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}
