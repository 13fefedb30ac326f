//! The ordering engine: one state machine per process, fixed role.
//!
//! On the sequencer process the engine drains the [`DeliveryQueue`] in
//! causal order, assigns global sequence numbers, delivers locally, and
//! hands sequenced wire lines to the broadcaster. On every other process
//! it drains the [`SequenceQueue`] in strict sequence order and discards
//! the now-redundant causal copies from its own DeliveryQueue.
//!
//! # Invariants
//!
//! 1. **Single deliverer**: only the engine thread delivers; the
//!    deliverability check and the pop are one atomic step (`pop_if`).
//! 2. **Head-stop**: if the causal head is not deliverable, nothing behind
//!    it can be: the local clock only advances via delivery, so a later
//!    entry becomes deliverable only after the head does. The scan safely
//!    stops at the first non-deliverable entry.
//! 3. **In-order total delivery**: a follower delivers sequence number
//!    `n + 1` or nothing. Gaps are retained and retried; stale duplicates
//!    are dropped. Both are logged as protocol anomalies.
//! 4. **Bounded session**: the engine terminates once the configured
//!    delivery budget is reached.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use log::{debug, error, info, warn};

use crate::app::{Application, DeliveryRecord};

use super::clock::{NodeId, SharedClock};
use super::message::{Message, SequencedMessage};
use super::queue::{DeliveryQueue, SequenceQueue};

/// How long a drained engine sleeps before re-checking, when no queue
/// change wakes it earlier.
const WAIT_INTERVAL: Duration = Duration::from_millis(50);

/// The engine's fixed role, chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// This process is the elected sequencer: it assigns the total order.
    Sequencing,
    /// This process follows the sequencer's assignment.
    Following,
}

/// What a finished engine hands back to the session.
pub struct EngineReport<A> {
    /// The application, with every delivery applied.
    pub app: A,
    /// Every delivery in local total order.
    pub history: Vec<DeliveryRecord>,
    /// Number of deliveries performed.
    pub delivered: u64,
    /// Sequence anomalies observed (gaps first seen, stale duplicates).
    pub anomalies: u64,
}

pub struct OrderingEngine<A: Application> {
    node_id: NodeId,
    role: Role,
    clock: Arc<SharedClock>,
    delivery_queue: Arc<DeliveryQueue>,
    sequence_queue: Arc<SequenceQueue>,
    /// Sequenced wire lines bound for the broadcaster. `None` on
    /// followers.
    sequenced_out: Option<Sender<String>>,
    app: A,
    delivery_budget: u64,
    /// Raised by a pump thread on channel failure; the engine then stops
    /// instead of waiting forever for messages that cannot arrive.
    shutdown: Arc<AtomicBool>,
    delivered: u64,
    /// Sequencer: last assigned number. Follower: last applied number.
    sequence_no: u64,
    anomalies: u64,
    history: Vec<DeliveryRecord>,
    last_gap_logged: Option<u64>,
    last_deferred_logged: Option<String>,
}

impl<A: Application> OrderingEngine<A> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        role: Role,
        clock: Arc<SharedClock>,
        delivery_queue: Arc<DeliveryQueue>,
        sequence_queue: Arc<SequenceQueue>,
        sequenced_out: Option<Sender<String>>,
        app: A,
        delivery_budget: u64,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        debug_assert!(
            (role == Role::Sequencing) == sequenced_out.is_some(),
            "only the sequencer emits sequenced messages"
        );
        OrderingEngine {
            node_id,
            role,
            clock,
            delivery_queue,
            sequence_queue,
            sequenced_out,
            app,
            delivery_budget,
            shutdown,
            delivered: 0,
            sequence_no: 0,
            anomalies: 0,
            history: Vec::new(),
            last_gap_logged: None,
            last_deferred_logged: None,
        }
    }

    /// Run to the delivery budget and return the report.
    pub fn run(mut self) -> EngineReport<A> {
        info!(
            "Node {}: ordering engine started, role {:?}, budget {}",
            self.node_id, self.role, self.delivery_budget
        );
        match self.role {
            Role::Sequencing => self.run_sequencing(),
            Role::Following => self.run_following(),
        }
        if self.aborted() {
            error!(
                "Node {}: session aborted after {} deliveries",
                self.node_id, self.delivered
            );
        } else {
            info!(
                "Node {}: ordering engine done, {} delivered, {} anomalies",
                self.node_id, self.delivered, self.anomalies
            );
        }
        EngineReport {
            app: self.app,
            history: self.history,
            delivered: self.delivered,
            anomalies: self.anomalies,
        }
    }

    fn aborted(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    fn run_sequencing(&mut self) {
        while self.delivered < self.delivery_budget && !self.aborted() {
            // Sample before the pop so an add racing with a failed pop is
            // seen by wait_newer instead of lost.
            let seen = self.delivery_queue.version();
            let popped = self.delivery_queue.pop_if(|head| {
                self.clock
                    .can_deliver(head.clock(), head.origin(), self.node_id)
            });
            match popped {
                Some(message) => {
                    let assigned = self.sequence_no + 1;
                    self.deliver(assigned, &message);
                    self.sequence_no = assigned;
                    self.emit_sequenced(assigned, message);
                }
                None => {
                    self.log_deferred_head();
                    self.delivery_queue.wait_newer(seen, WAIT_INTERVAL);
                }
            }
        }
    }

    fn run_following(&mut self) {
        // Messages applied through the sequenced path, pending removal
        // from the causal queue.
        let mut applied: HashSet<Message> = HashSet::new();

        while self.delivered < self.delivery_budget && !self.aborted() {
            let seen = self.sequence_queue.version();
            let next = self.sequence_no + 1;
            match self.sequence_queue.pop_if(|head| head.sequence_no() <= next) {
                Some(sm) if sm.sequence_no() == next => {
                    let message = sm.into_message();
                    self.deliver(next, &message);
                    self.sequence_no = next;
                    self.last_gap_logged = None;
                    applied.insert(message);
                }
                Some(sm) => {
                    // Behind the local cursor: a duplicate can never
                    // become deliverable, so it is safe to drop.
                    self.anomalies += 1;
                    warn!(
                        "Node {}: dropping stale sequenced message {} (already at {})",
                        self.node_id,
                        sm.sequence_no(),
                        self.sequence_no
                    );
                }
                None => {
                    if !applied.is_empty() {
                        self.delivery_queue.remove_all(&applied);
                        applied.clear();
                    }
                    self.log_gap();
                    self.sequence_queue.wait_newer(seen, WAIT_INTERVAL);
                }
            }
        }

        if !applied.is_empty() {
            self.delivery_queue.remove_all(&applied);
        }
    }

    fn deliver(&mut self, sequence_no: u64, message: &Message) {
        self.clock.merge(message.clock());
        self.delivered += 1;
        self.last_deferred_logged = None;
        info!("Delivered: {}", message.to_wire());
        let record = DeliveryRecord {
            sequence_no,
            origin: message.origin(),
            clock: message.clock().clone(),
            content: message.content().to_string(),
        };
        self.app.deliver(&record);
        self.history.push(record);
    }

    fn emit_sequenced(&mut self, sequence_no: u64, message: Message) {
        let out = self
            .sequenced_out
            .as_ref()
            .expect("sequencing engine has an outbound channel");
        let line = SequencedMessage::new(sequence_no, message).to_wire();
        if out.send(line).is_err() {
            // Broadcaster already gone; the session join will surface its
            // failure. Keep delivering locally so the engine can finish.
            error!(
                "Node {}: broadcaster unavailable, sequenced message {} not transmitted",
                self.node_id, sequence_no
            );
        }
    }

    /// A non-deliverable head is the expected wait-for-dependency state,
    /// worth one log line per distinct head, not one per poll.
    fn log_deferred_head(&mut self) {
        if let Some(head) = self.delivery_queue.peek_head() {
            let wire = head.to_wire();
            if self.last_deferred_logged.as_deref() != Some(wire.as_str()) {
                debug!(
                    "Node {}: unable to deliver {} yet, waiting on causal dependencies",
                    self.node_id, wire
                );
                self.last_deferred_logged = Some(wire);
            }
        }
    }

    fn log_gap(&mut self) {
        if let Some(head) = self.sequence_queue.peek_head() {
            if self.last_gap_logged != Some(head.sequence_no()) {
                self.anomalies += 1;
                warn!(
                    "Node {}: sequence gap: head is {} while expecting {}, retaining until the gap fills",
                    self.node_id,
                    head.sequence_no(),
                    self.sequence_no + 1
                );
                self.last_gap_logged = Some(head.sequence_no());
            }
        }
    }
}
