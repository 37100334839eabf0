//! Session events
//!
//! Subscribers get their own `mpsc` receiver; a subscriber that drops its
//! receiver is pruned on the next publish.

use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::telemetry::{Range, TelemetrySample};

/// Everything a session reports outside request/response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    /// Input the codec could not use
    RawMessage { raw: String, reason: String },
    Telemetry(TelemetrySample),
    /// Error report from the device
    DeviceError {
        error_type: String,
        code: i32,
        description: String,
    },
    FlashProgress(u8),
    FlashDone,
    FirmwareProgress(u8),
    FirmwareDone,
    /// No successful parse within the expected interval
    LinkStale { since_last_parse: Duration },
    /// The link is unusable; the session must be rebuilt
    ReconnectNeeded { reason: String },
    IgnitionChanged { ignited: bool },
    RangeChanged(Range),
    /// The device announced it is powering down
    DeviceShutdown { reason: String },
}

/// Fan-out of [`SessionEvent`]s to any number of subscribers
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<SessionEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    pub fn publish(&self, event: SessionEvent) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fan_out_and_prune() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.publish(SessionEvent::FlashDone);
        assert_eq!(a.try_recv().unwrap(), SessionEvent::FlashDone);
        assert_eq!(b.try_recv().unwrap(), SessionEvent::FlashDone);

        drop(b);
        bus.publish(SessionEvent::FlashProgress(50));
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(a.try_recv().unwrap(), SessionEvent::FlashProgress(50));
    }
}
