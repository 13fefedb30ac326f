//! Vector clocks and the causal-deliverability predicate.
//!
//! One clock instance exists per process, created all-zero at startup.
//!
//! # Invariants
//!
//! 1. **Own-slot monotonicity**: a process's own component never decreases.
//!    It is advanced only by `increment` (on local broadcast).
//! 2. **Merge monotonicity**: `merge` is a pointwise max, so no component
//!    ever decreases through delivery either.
//! 3. **Single critical section**: the process-wide clock is mutated only
//!    through [`SharedClock`], which holds one lock across every multi-slot
//!    read or update. Raw slot access is never exposed for external
//!    read-modify-write sequences.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Logical process identifier. Ids are 1-based on the wire and in
/// configuration; clock slots are 0-based internally.
pub type NodeId = u32;

/// Result of comparing two vector clocks.
///
/// Vector clocks form a partial order: two clocks where neither dominates
/// the other are `Concurrent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrder {
    /// Every component `<=`, at least one `<`.
    Before,
    /// Every component `>=`, at least one `>`.
    After,
    /// Neither dominates (includes the equal case).
    Concurrent,
}

/// A fixed-length vector of logical counters, one slot per process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VectorClock {
    components: Vec<u64>,
}

impl VectorClock {
    /// Create an all-zero clock for a cluster of `num_processes` processes.
    pub fn new(num_processes: usize) -> Self {
        VectorClock {
            components: vec![0; num_processes],
        }
    }

    /// Number of slots (the cluster size this clock was built for).
    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Read one component. Slots are 0-based.
    #[inline]
    pub fn component(&self, slot: usize) -> u64 {
        self.components[slot]
    }

    /// Advance this process's own slot by one. Called on local broadcast.
    pub fn increment(&mut self, process_id: NodeId) {
        let slot = slot_of(process_id);
        self.components[slot] += 1;
    }

    /// Pointwise max with `other`. Called on delivery.
    pub fn merge(&mut self, other: &VectorClock) {
        debug_assert_eq!(self.components.len(), other.components.len());
        for (mine, theirs) in self.components.iter_mut().zip(&other.components) {
            if *theirs > *mine {
                *mine = *theirs;
            }
        }
    }

    /// Compare against `other` under the causal partial order.
    pub fn compare(&self, other: &VectorClock) -> ClockOrder {
        let mut less = false;
        let mut greater = false;
        for (mine, theirs) in self.components.iter().zip(&other.components) {
            if mine < theirs {
                less = true;
            } else if mine > theirs {
                greater = true;
            }
        }
        match (less, greater) {
            (true, false) => ClockOrder::Before,
            (false, true) => ClockOrder::After,
            _ => ClockOrder::Concurrent,
        }
    }

    /// The causal-deliverability predicate, evaluated against the local
    /// clock (`self`).
    ///
    /// A message stamped `received` and originated by `origin` is
    /// deliverable at process `self_id` when:
    ///
    /// - `origin == self_id` (our own message, already incremented by the
    ///   send path): the origin slot must match exactly;
    /// - otherwise: the origin slot must be exactly one behind the
    ///   message's (`self[origin] == received[origin] - 1`, the next
    ///   message expected from that origin);
    /// - and for every other slot `k`: `self[k] >= received[k]` (all
    ///   causal dependencies already observed).
    ///
    /// A `false` result is not an error: the caller defers the message and
    /// re-checks after the local clock advances.
    pub fn can_deliver(&self, received: &VectorClock, origin: NodeId, self_id: NodeId) -> bool {
        let origin_slot = slot_of(origin);
        let local = self.components[origin_slot];
        let stamped = received.components[origin_slot];

        if origin == self_id {
            if local != stamped {
                return false;
            }
        } else if stamped == 0 || local != stamped - 1 {
            return false;
        }

        for slot in 0..self.components.len() {
            if slot != origin_slot && self.components[slot] < received.components[slot] {
                return false;
            }
        }
        true
    }

    /// Sum of all components. Delivery only ever grows a clock, so a
    /// causally earlier clock always has a strictly smaller sum; the sum
    /// is the primary key of the queue's total refinement of causal order.
    pub fn weight(&self) -> u64 {
        self.components.iter().sum()
    }

    /// Raw components, for ordering and tests.
    pub fn components(&self) -> &[u64] {
        &self.components
    }
}

/// Wire form: `c1,c2,...,cN` (decimal, comma-separated).
impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, c) in self.components.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl FromStr for VectorClock {
    type Err = ClockParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut components = Vec::new();
        for part in s.split(',') {
            let value = part
                .trim()
                .parse::<u64>()
                .map_err(|_| ClockParseError::BadComponent(part.to_string()))?;
            components.push(value);
        }
        Ok(VectorClock { components })
    }
}

/// Failure to parse a clock's wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClockParseError {
    /// A component was not a non-negative decimal integer.
    BadComponent(String),
}

impl fmt::Display for ClockParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClockParseError::BadComponent(part) => {
                write!(f, "clock component {:?} is not a non-negative integer", part)
            }
        }
    }
}

impl std::error::Error for ClockParseError {}

#[inline]
fn slot_of(process_id: NodeId) -> usize {
    debug_assert!(process_id >= 1, "process ids are 1-based");
    (process_id - 1) as usize
}

/// The process-wide clock, shared between the broadcaster (increments) and
/// the ordering engine (merges). Every operation is one critical section.
pub struct SharedClock {
    inner: Mutex<VectorClock>,
}

impl SharedClock {
    /// Create the process clock, all-zero.
    pub fn new(num_processes: usize) -> Self {
        SharedClock {
            inner: Mutex::new(VectorClock::new(num_processes)),
        }
    }

    /// Increment this process's slot and return the resulting snapshot in
    /// one critical section. This is the send-path stamp: the snapshot is
    /// the timestamp of the outgoing message.
    pub fn stamp(&self, self_id: NodeId) -> VectorClock {
        let mut clock = self.inner.lock().unwrap();
        clock.increment(self_id);
        clock.clone()
    }

    /// Merge a delivered message's clock into the process clock.
    pub fn merge(&self, other: &VectorClock) {
        self.inner.lock().unwrap().merge(other);
    }

    /// Evaluate deliverability against the current process clock.
    pub fn can_deliver(&self, received: &VectorClock, origin: NodeId, self_id: NodeId) -> bool {
        self.inner.lock().unwrap().can_deliver(received, origin, self_id)
    }

    /// Snapshot the current clock value.
    pub fn snapshot(&self) -> VectorClock {
        self.inner.lock().unwrap().clone()
    }
}
