//! Total-order broadcast core.
//!
//! Every process proposes messages; all processes deliver all messages in
//! one identical global order, and each process's own messages also
//! respect causal (happened-before) order. Ordering is produced in two
//! layers:
//!
//! - a vector-clock causal layer: fresh broadcasts queue locally until
//!   their causal dependencies are delivered;
//! - a centralized sequencer: one elected process drains its causal queue
//!   in causal order, assigns consecutive sequence numbers, and
//!   rebroadcasts; every other process applies strictly in sequence order.
//!
//! # Invariants
//!
//! 1. **Agreement**: processes that complete a session deliver the same
//!    messages in the same order.
//! 2. **Causal prefix**: no message is delivered before a message it
//!    causally depends on.
//! 3. **Per-origin FIFO**: one origin's messages are delivered everywhere
//!    in send order.
//! 4. **Exactly once**: each message is delivered once per process; the
//!    causal copy of a sequenced delivery is discarded, never re-delivered.

pub mod broker;
pub mod clock;
pub mod engine;
pub mod message;
pub mod queue;

#[cfg(test)]
mod tests;

pub use broker::{start, Session, SessionError, SessionParams, COMPLETE};
pub use clock::{ClockOrder, NodeId, SharedClock, VectorClock};
pub use engine::{EngineReport, OrderingEngine, Role};
pub use message::{is_sequenced_wire, Message, SequencedMessage, WireError};
pub use queue::{DeliveryQueue, SequenceQueue};
