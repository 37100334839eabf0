//! Shared store of received messages
//!
//! Written only by the receive loop, read by any number of callers. Each
//! key keeps just its latest message; a short history ring and a bulk
//! queue sit beside it, plus the latest error report per key.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// Capacity of the history ring
pub const HISTORY_CAPACITY: usize = 20;

/// A stored inbound message
#[derive(Debug, Clone)]
pub struct Stored<M> {
    pub message: M,
    pub received_at: Instant,
    /// Arrival order across the whole session
    pub seq: u64,
}

/// Latest error the device reported for one request type
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    pub error_type: String,
    pub code: i32,
    pub observed_at: Instant,
}

#[derive(Debug)]
struct Slot<M> {
    entry: Stored<M>,
    consumed: bool,
}

#[derive(Debug)]
struct Inner<M, K> {
    latest: HashMap<K, Slot<M>>,
    history: VecDeque<Stored<M>>,
    bulk: VecDeque<Stored<M>>,
    errors: HashMap<K, ErrorRecord>,
    next_seq: u64,
}

#[derive(Debug)]
pub struct ResponseStore<M, K> {
    inner: RwLock<Inner<M, K>>,
}

impl<M: Clone, K: Copy + Eq + Hash> ResponseStore<M, K> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                latest: HashMap::new(),
                history: VecDeque::with_capacity(HISTORY_CAPACITY),
                bulk: VecDeque::new(),
                errors: HashMap::new(),
                next_seq: 0,
            }),
        }
    }

    // No update leaves Inner half-written, so a poisoned lock still holds
    // usable state.
    fn read(&self) -> RwLockReadGuard<'_, Inner<M, K>> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<M, K>> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn stamp(inner: &mut Inner<M, K>, message: M) -> Stored<M> {
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let stored = Stored {
            message,
            received_at: Instant::now(),
            seq,
        };
        if inner.history.len() == HISTORY_CAPACITY {
            inner.history.pop_front();
        }
        inner.history.push_back(stored.clone());
        stored
    }

    /// Store a response, replacing whatever was held for `key`
    pub fn record_response(&self, key: K, message: M) {
        let mut inner = self.write();
        let entry = Self::stamp(&mut inner, message);
        inner.latest.insert(
            key,
            Slot {
                entry,
                consumed: false,
            },
        );
    }

    /// Queue one part of a bulk reply
    pub fn record_bulk(&self, message: M) {
        let mut inner = self.write();
        let entry = Self::stamp(&mut inner, message);
        inner.bulk.push_back(entry);
    }

    pub fn record_error(&self, key: K, error_type: impl Into<String>, code: i32) {
        self.write().errors.insert(
            key,
            ErrorRecord {
                error_type: error_type.into(),
                code,
                observed_at: Instant::now(),
            },
        );
    }

    /// Take the response for `key` if it arrived at or after `since` and no
    /// other caller has taken it
    pub fn take_since(&self, key: K, since: Instant) -> Option<Stored<M>> {
        let mut inner = self.write();
        let slot = inner.latest.get_mut(&key)?;
        if slot.consumed || slot.entry.received_at < since {
            return None;
        }
        slot.consumed = true;
        Some(slot.entry.clone())
    }

    /// Latest response for `key`, consumed or not
    pub fn peek(&self, key: K) -> Option<Stored<M>> {
        self.read().latest.get(&key).map(|slot| slot.entry.clone())
    }

    /// Error reported for `key` at or after `since`
    pub fn error_since(&self, key: K, since: Instant) -> Option<ErrorRecord> {
        self.read()
            .errors
            .get(&key)
            .filter(|record| record.observed_at >= since)
            .cloned()
    }

    /// Remove and return queued bulk messages received at or after `since`.
    /// Older ones are dropped.
    pub fn drain_bulk_since(&self, since: Instant) -> Vec<Stored<M>> {
        self.write()
            .bulk
            .drain(..)
            .filter(|s| s.received_at >= since)
            .collect()
    }

    pub fn bulk_len(&self) -> usize {
        self.read().bulk.len()
    }

    /// Most recent messages of any kind, oldest first
    pub fn history(&self) -> Vec<Stored<M>> {
        self.read().history.iter().cloned().collect()
    }

    /// Messages received so far
    pub fn received(&self) -> u64 {
        self.read().next_seq
    }
}

impl<M: Clone, K: Copy + Eq + Hash> Default for ResponseStore<M, K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_latest_wins_and_consumed_once() {
        let store: ResponseStore<&str, u8> = ResponseStore::new();
        let since = Instant::now();
        store.record_response(1, "first");
        store.record_response(1, "second");
        let taken = store.take_since(1, since).unwrap();
        assert_eq!(taken.message, "second");
        assert_eq!(taken.seq, 1);
        assert!(store.take_since(1, since).is_none());
        assert_eq!(store.peek(1).unwrap().message, "second");
    }

    #[test]
    fn test_older_than_send_ignored() {
        let store: ResponseStore<&str, u8> = ResponseStore::new();
        store.record_response(1, "stale");
        std::thread::sleep(Duration::from_millis(2));
        let since = Instant::now();
        assert!(store.take_since(1, since).is_none());
        store.record_response(1, "fresh");
        assert_eq!(store.take_since(1, since).unwrap().message, "fresh");
    }

    #[test]
    fn test_errors_and_history() {
        let store: ResponseStore<u32, u8> = ResponseStore::new();
        let since = Instant::now();
        store.record_error(7, "ReadFlash", 7);
        assert_eq!(store.error_since(7, since).unwrap().code, 7);
        assert!(store.error_since(8, since).is_none());

        for i in 0..30 {
            store.record_response(1, i);
        }
        let history = store.history();
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert_eq!(history[0].message, 10);
    }

    #[test]
    fn test_bulk_queue() {
        let store: ResponseStore<u32, u8> = ResponseStore::new();
        let since = Instant::now();
        store.record_bulk(1);
        store.record_bulk(2);
        assert_eq!(store.bulk_len(), 2);
        let drained: Vec<u32> = store.drain_bulk_since(since).into_iter().map(|s| s.message).collect();
        assert_eq!(drained, vec![1, 2]);
        assert_eq!(store.bulk_len(), 0);
    }

    #[test]
    fn test_poisoned_lock_keeps_recording() {
        let store: ResponseStore<u32, u8> = ResponseStore::new();
        store.record_response(1, 10);
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = store.inner.write().unwrap();
            panic!("receive loop died holding the lock");
        }));
        assert!(store.inner.is_poisoned());

        let since = Instant::now();
        store.record_response(1, 11);
        store.record_bulk(12);
        assert_eq!(store.take_since(1, since).unwrap().message, 11);
        assert_eq!(store.bulk_len(), 1);
        assert_eq!(store.received(), 3);
    }
}
