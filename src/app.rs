//! The application boundary: what the ordering engine delivers into.
//!
//! The engine invokes [`Application::deliver`] exactly once per delivered
//! message, in the process's locally-enforced total order. Implementations
//! must not assume anything about timing beyond that ordering; delivery
//! happens on the engine thread.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::broadcast::clock::{NodeId, VectorClock};

/// One delivery, as observed by the local process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    /// Position in the global total order (1-based, sequencer-assigned).
    pub sequence_no: u64,
    /// Originating process id.
    pub origin: NodeId,
    /// The message's vector-clock timestamp.
    pub clock: VectorClock,
    /// Decoded payload text.
    pub content: String,
}

/// A consumer of totally-ordered deliveries.
///
/// # Laws
///
/// 1. `deliver` is invoked exactly once per message, in total order.
/// 2. Implementations must be deterministic in the delivered sequence:
///    two processes applying the same sequence end in the same state.
pub trait Application: Send + 'static {
    fn deliver(&mut self, record: &DeliveryRecord);
}

/// No-op application, for sessions that only need the delivery history.
impl Application for () {
    fn deliver(&mut self, _record: &DeliveryRecord) {}
}

/// A replicated in-memory key-value store fed by delivered writes.
///
/// Understands two payload forms:
///
/// - `WRITE <key> <value...>`: upsert. The value is the remainder of the
///   line and may contain spaces.
/// - `READ <key>`: no state change (reads are answered locally; the
///   broadcast only establishes their position in the order).
///
/// Any other payload is ignored: the store coexists with free-text
/// broadcast traffic.
#[derive(Debug, Default)]
pub struct KvStore {
    entries: HashMap<String, String>,
    applied_writes: u64,
}

impl KvStore {
    pub fn new() -> Self {
        KvStore::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of `WRITE` payloads applied so far.
    pub fn applied_writes(&self) -> u64 {
        self.applied_writes
    }
}

impl Application for KvStore {
    fn deliver(&mut self, record: &DeliveryRecord) {
        let mut parts = record.content.splitn(3, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("WRITE"), Some(key), Some(value)) => {
                self.entries.insert(key.to_string(), value.to_string());
                self.applied_writes += 1;
            }
            (Some("READ"), Some(_key), _) => {}
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seq: u64, content: &str) -> DeliveryRecord {
        DeliveryRecord {
            sequence_no: seq,
            origin: 1,
            clock: "1,0,0".parse().unwrap(),
            content: content.to_string(),
        }
    }

    #[test]
    fn test_kv_store_applies_writes_in_order() {
        let mut store = KvStore::new();
        store.deliver(&record(1, "WRITE color blue"));
        store.deliver(&record(2, "WRITE color dark red"));
        store.deliver(&record(3, "READ color"));

        assert_eq!(store.get("color"), Some("dark red"));
        assert_eq!(store.applied_writes(), 2);
    }

    #[test]
    fn test_kv_store_ignores_free_text() {
        let mut store = KvStore::new();
        store.deliver(&record(1, "Message no.1 from 2"));
        store.deliver(&record(2, "WRITE"));
        assert!(store.is_empty());
        assert_eq!(store.applied_writes(), 0);
    }
}
