//! Thread-safe priority queues feeding the ordering engine.
//!
//! These are the only synchronization points between the per-peer receiver
//! threads (producers) and the engine thread (the sole consumer that
//! delivers). Both queues pair a binary heap with a version counter and a
//! condvar: every mutation bumps the version and signals, so a consumer
//! can block for "something changed since I last looked" without busy
//! polling and without missed-wakeup races.
//!
//! # Invariants
//!
//! 1. **Undelivered only**: an entry leaves the queue exactly once, via
//!    `pop_if` or `remove_all`.
//! 2. **Atomic check-and-pop**: `pop_if` evaluates its predicate and
//!    removes the head under one lock, so deliverability can never be
//!    observed by two consumers for the same entry.
//! 3. **Version monotonicity**: `version()` strictly increases across
//!    mutations; `wait_newer(seen)` returns as soon as the version differs
//!    from `seen`.

use std::collections::{BinaryHeap, HashSet};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use super::message::{Message, SequencedMessage};

struct Inner<T: Ord> {
    heap: BinaryHeap<std::cmp::Reverse<T>>,
    version: u64,
}

/// Min-ordered blocking priority queue. `T`'s `Ord` decides the head.
struct PriorityQueue<T: Ord> {
    inner: Mutex<Inner<T>>,
    changed: Condvar,
}

impl<T: Ord + Clone> PriorityQueue<T> {
    fn new() -> Self {
        PriorityQueue {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                version: 0,
            }),
            changed: Condvar::new(),
        }
    }

    fn add(&self, item: T) {
        let mut inner = self.inner.lock().unwrap();
        inner.heap.push(std::cmp::Reverse(item));
        inner.version += 1;
        self.changed.notify_all();
    }

    fn peek_head(&self) -> Option<T> {
        let inner = self.inner.lock().unwrap();
        inner.heap.peek().map(|r| r.0.clone())
    }

    fn poll_head(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        let popped = inner.heap.pop().map(|r| r.0);
        if popped.is_some() {
            inner.version += 1;
            self.changed.notify_all();
        }
        popped
    }

    /// Pop the head only if `pred` accepts it, under one lock.
    fn pop_if(&self, pred: impl FnOnce(&T) -> bool) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        let accepted = match inner.heap.peek() {
            Some(head) => pred(&head.0),
            None => false,
        };
        if !accepted {
            return None;
        }
        let popped = inner.heap.pop().map(|r| r.0);
        inner.version += 1;
        self.changed.notify_all();
        popped
    }

    fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().heap.is_empty()
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap().heap.len()
    }

    fn contains(&self, item: &T) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.heap.iter().any(|r| &r.0 == item)
    }

    fn version(&self) -> u64 {
        self.inner.lock().unwrap().version
    }

    /// Block until the version differs from `seen` or `timeout` elapses.
    /// Returns the current version either way.
    fn wait_newer(&self, seen: u64, timeout: Duration) -> u64 {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        while inner.version == seen {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, result) = self.changed.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
            if result.timed_out() {
                break;
            }
        }
        inner.version
    }

    fn retain(&self, mut keep: impl FnMut(&T) -> bool) {
        let mut inner = self.inner.lock().unwrap();
        let heap = std::mem::take(&mut inner.heap);
        inner.heap = heap.into_iter().filter(|r| keep(&r.0)).collect();
        inner.version += 1;
        self.changed.notify_all();
    }
}

/// The local causal queue: undelivered [`Message`]s ordered by the
/// deterministic total refinement of causal order (see `Message`'s `Ord`).
pub struct DeliveryQueue {
    queue: PriorityQueue<Message>,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        DeliveryQueue {
            queue: PriorityQueue::new(),
        }
    }

    pub fn add(&self, message: Message) {
        self.queue.add(message);
    }

    pub fn peek_head(&self) -> Option<Message> {
        self.queue.peek_head()
    }

    pub fn poll_head(&self) -> Option<Message> {
        self.queue.poll_head()
    }

    /// Atomically pop the head when it satisfies `pred` (deliverability,
    /// in practice).
    pub fn pop_if(&self, pred: impl FnOnce(&Message) -> bool) -> Option<Message> {
        self.queue.pop_if(pred)
    }

    /// Whether `message` is still queued (undelivered).
    pub fn contains(&self, message: &Message) -> bool {
        self.queue.contains(message)
    }

    /// Discard every queued message present in `delivered`. Used after
    /// sequenced deliveries so the causal path cannot re-deliver them.
    pub fn remove_all(&self, delivered: &HashSet<Message>) {
        if delivered.is_empty() {
            return;
        }
        self.queue.retain(|m| !delivered.contains(m));
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn version(&self) -> u64 {
        self.queue.version()
    }

    pub fn wait_newer(&self, seen: u64, timeout: Duration) -> u64 {
        self.queue.wait_newer(seen, timeout)
    }
}

impl Default for DeliveryQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// The remote sequenced queue: [`SequencedMessage`]s not yet applied,
/// ordered strictly by sequence number.
pub struct SequenceQueue {
    queue: PriorityQueue<SequencedMessage>,
}

impl SequenceQueue {
    pub fn new() -> Self {
        SequenceQueue {
            queue: PriorityQueue::new(),
        }
    }

    pub fn add(&self, message: SequencedMessage) {
        self.queue.add(message);
    }

    pub fn peek_head(&self) -> Option<SequencedMessage> {
        self.queue.peek_head()
    }

    pub fn poll_head(&self) -> Option<SequencedMessage> {
        self.queue.poll_head()
    }

    pub fn pop_if(&self, pred: impl FnOnce(&SequencedMessage) -> bool) -> Option<SequencedMessage> {
        self.queue.pop_if(pred)
    }

    /// Materialize the currently-queued messages as a set, stripped of
    /// their sequence numbers. This is the legacy input to
    /// `DeliveryQueue::remove_all`; the engine instead removes exactly
    /// what it applied, which excludes retained gap entries.
    pub fn snapshot_set(&self) -> HashSet<Message> {
        let inner = self.queue.inner.lock().unwrap();
        inner
            .heap
            .iter()
            .map(|r| r.0.message().clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn version(&self) -> u64 {
        self.queue.version()
    }

    pub fn wait_newer(&self, seen: u64, timeout: Duration) -> u64 {
        self.queue.wait_newer(seen, timeout)
    }
}

impl Default for SequenceQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::clock::VectorClock;
    use std::sync::Arc;
    use std::thread;

    fn message(components: &[u64], origin: u32, content: &str) -> Message {
        let wire: Vec<String> = components.iter().map(|c| c.to_string()).collect();
        let clock: VectorClock = wire.join(",").parse().unwrap();
        Message::new(clock, origin, content.to_string())
    }

    #[test]
    fn test_delivery_queue_orders_causally() {
        let queue = DeliveryQueue::new();
        let late = message(&[0, 2, 0], 2, "second from 2");
        let early = message(&[0, 1, 0], 2, "first from 2");
        queue.add(late.clone());
        queue.add(early.clone());

        assert_eq!(queue.poll_head(), Some(early));
        assert_eq!(queue.poll_head(), Some(late));
        assert_eq!(queue.poll_head(), None);
    }

    #[test]
    fn test_delivery_queue_tie_break_by_origin() {
        let queue = DeliveryQueue::new();
        let from_three = message(&[0, 0, 1], 3, "B");
        let from_two = message(&[0, 1, 0], 2, "A");
        queue.add(from_three);
        queue.add(from_two.clone());
        assert_eq!(queue.poll_head(), Some(from_two));
    }

    #[test]
    fn test_pop_if_rejects_head() {
        let queue = DeliveryQueue::new();
        queue.add(message(&[0, 1, 0], 2, "A"));
        assert_eq!(queue.pop_if(|_| false), None);
        assert_eq!(queue.len(), 1);
        assert!(queue.pop_if(|_| true).is_some());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_remove_all() {
        let queue = DeliveryQueue::new();
        let a = message(&[0, 1, 0], 2, "A");
        let b = message(&[0, 0, 1], 3, "B");
        let c = message(&[0, 1, 1], 3, "C");
        queue.add(a.clone());
        queue.add(b.clone());
        queue.add(c.clone());

        let mut delivered = HashSet::new();
        delivered.insert(a);
        delivered.insert(c);
        queue.remove_all(&delivered);

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.poll_head(), Some(b));
    }

    #[test]
    fn test_contains() {
        let queue = DeliveryQueue::new();
        let a = message(&[0, 1, 0], 2, "A");
        let b = message(&[0, 0, 1], 3, "B");
        queue.add(a.clone());
        assert!(queue.contains(&a));
        assert!(!queue.contains(&b));
        queue.poll_head();
        assert!(!queue.contains(&a));
    }

    #[test]
    fn test_sequence_queue_snapshot_set() {
        let queue = SequenceQueue::new();
        let a = message(&[0, 1, 0], 2, "A");
        let b = message(&[0, 0, 1], 3, "B");
        queue.add(SequencedMessage::new(1, a.clone()));
        queue.add(SequencedMessage::new(2, b.clone()));

        let snapshot = queue.snapshot_set();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.contains(&a));
        assert!(snapshot.contains(&b));
        // The queue itself is untouched.
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_sequence_queue_orders_by_sequence_no() {
        let queue = SequenceQueue::new();
        queue.add(SequencedMessage::new(3, message(&[0, 0, 1], 3, "third")));
        queue.add(SequencedMessage::new(1, message(&[0, 1, 0], 2, "first")));
        queue.add(SequencedMessage::new(2, message(&[1, 0, 0], 1, "second")));

        let order: Vec<u64> = std::iter::from_fn(|| queue.poll_head())
            .map(|sm| sm.sequence_no())
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_wait_newer_sees_concurrent_add() {
        let queue = Arc::new(DeliveryQueue::new());
        let seen = queue.version();

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.add(message(&[0, 1, 0], 2, "A"));
            })
        };

        let newer = queue.wait_newer(seen, Duration::from_secs(5));
        assert_ne!(newer, seen);
        assert_eq!(queue.len(), 1);
        producer.join().unwrap();
    }

    #[test]
    fn test_concurrent_add_and_poll_loses_nothing() {
        let queue = Arc::new(DeliveryQueue::new());
        let total = 200u64;

        let producers: Vec<_> = (2..=3u32)
            .map(|origin| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for k in 1..=total {
                        let mut components = [0u64; 3];
                        components[(origin - 1) as usize] = k;
                        queue.add(message(&components, origin, &format!("{}:{}", origin, k)));
                    }
                })
            })
            .collect();

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || {
                let mut drained = 0u64;
                while drained < total * 2 {
                    match queue.poll_head() {
                        Some(_) => drained += 1,
                        None => {
                            let seen = queue.version();
                            queue.wait_newer(seen, Duration::from_millis(10));
                        }
                    }
                }
                drained
            })
        };

        for p in producers {
            p.join().unwrap();
        }
        assert_eq!(consumer.join().unwrap(), total * 2);
        assert!(queue.is_empty());
    }
}
