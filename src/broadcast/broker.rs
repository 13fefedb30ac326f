//! Per-node broadcast session: thread orchestration around the engine.
//!
//! A running session owns one receiver thread per peer link, one
//! broadcaster thread, and one ordering-engine thread. The queues and
//! the shared clock are their only coordination points.
//!
//! Lifecycle: [`start`] spawns everything; the caller submits payloads
//! through [`Session::broadcast`]; [`Session::finish`] closes the input,
//! joins the engine (which runs to its delivery budget), joins the
//! broadcaster, sends `COMPLETE` on every link, and finally joins each
//! receiver, which terminates when it has read its peer's one
//! `COMPLETE` line.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{never, select, unbounded, Receiver, Sender};
use log::{debug, info, warn};

use crate::app::Application;
use crate::net::{LineSink, LineSource, Link, LinkError};

use super::clock::{NodeId, SharedClock};
use super::engine::{EngineReport, OrderingEngine, Role};
use super::message::{self, Message, SequencedMessage};
use super::queue::{DeliveryQueue, SequenceQueue};

/// Control line closing a session; one per process, after its budget.
pub const COMPLETE: &str = "COMPLETE";

/// Plain constructor parameters for one node's session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub node_id: NodeId,
    pub num_processes: usize,
    pub sequencer_id: NodeId,
    /// Total deliveries this process performs before the session ends.
    pub delivery_budget: u64,
}

impl SessionParams {
    pub fn role(&self) -> Role {
        if self.node_id == self.sequencer_id {
            Role::Sequencing
        } else {
            Role::Following
        }
    }
}

/// A session failure. Channel-level failures are fatal to the whole
/// session; the core does not reconnect.
#[derive(Debug)]
pub enum SessionError {
    Link { peer: NodeId, source: LinkError },
    /// The broadcaster is gone, so no further payload can be submitted.
    InputClosed,
    WorkerPanicked(&'static str),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Link { peer, source } => {
                write!(f, "link to node {} failed: {}", peer, source)
            }
            SessionError::InputClosed => write!(f, "broadcast input is closed"),
            SessionError::WorkerPanicked(which) => write!(f, "{} thread panicked", which),
        }
    }
}

impl std::error::Error for SessionError {}

/// Handle to a running node session.
pub struct Session<A> {
    params: SessionParams,
    input_tx: Option<Sender<String>>,
    sinks: Vec<(NodeId, Arc<dyn LineSink>)>,
    receiver_handles: Vec<(NodeId, JoinHandle<Result<(), LinkError>>)>,
    broadcaster_handle: JoinHandle<Result<(), SessionError>>,
    engine_handle: JoinHandle<EngineReport<A>>,
}

/// Spawn the session threads over established links.
///
/// `links` must hold exactly one link per peer; the READY rendezvous (or
/// its in-memory equivalent) must already have happened.
pub fn start<A: Application>(params: SessionParams, links: Vec<Link>, app: A) -> Session<A> {
    debug_assert_eq!(links.len(), params.num_processes - 1);

    let clock = Arc::new(SharedClock::new(params.num_processes));
    let delivery_queue = Arc::new(DeliveryQueue::new());
    let sequence_queue = Arc::new(SequenceQueue::new());
    // Raised by any pump thread on channel failure so the engine stops
    // waiting for traffic that can no longer arrive.
    let shutdown = Arc::new(AtomicBool::new(false));
    let role = params.role();

    let (input_tx, input_rx) = unbounded::<String>();
    let (seq_tx, seq_rx) = match role {
        Role::Sequencing => {
            let (tx, rx) = unbounded::<String>();
            (Some(tx), Some(rx))
        }
        Role::Following => (None, None),
    };

    let mut sinks = Vec::with_capacity(links.len());
    let mut receiver_handles = Vec::with_capacity(links.len());
    for link in links {
        let Link { peer, sink, source } = link;
        sinks.push((peer, sink));
        let handle = {
            let params = params.clone();
            let delivery_queue = delivery_queue.clone();
            let sequence_queue = sequence_queue.clone();
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name(format!("totem-recv-{}", peer))
                .spawn(move || {
                    let result =
                        receiver_loop(params, peer, source, delivery_queue, sequence_queue);
                    if result.is_err() {
                        shutdown.store(true, Ordering::Relaxed);
                    }
                    result
                })
                .expect("failed to spawn receiver thread")
        };
        receiver_handles.push((peer, handle));
    }

    let broadcaster_handle = {
        let params = params.clone();
        let sinks = sinks.clone();
        let clock = clock.clone();
        let delivery_queue = delivery_queue.clone();
        let shutdown = shutdown.clone();
        thread::Builder::new()
            .name("totem-broadcast".to_string())
            .spawn(move || {
                let result = broadcaster_loop(
                    params,
                    sinks,
                    input_rx,
                    seq_rx,
                    clock,
                    delivery_queue,
                    shutdown.clone(),
                );
                if result.is_err() {
                    shutdown.store(true, Ordering::Relaxed);
                }
                result
            })
            .expect("failed to spawn broadcaster thread")
    };

    let engine_handle = {
        let engine = OrderingEngine::new(
            params.node_id,
            role,
            clock,
            delivery_queue,
            sequence_queue,
            seq_tx,
            app,
            params.delivery_budget,
            shutdown,
        );
        thread::Builder::new()
            .name("totem-engine".to_string())
            .spawn(move || engine.run())
            .expect("failed to spawn engine thread")
    };

    Session {
        params,
        input_tx: Some(input_tx),
        sinks,
        receiver_handles,
        broadcaster_handle,
        engine_handle,
    }
}

impl<A> Session<A> {
    /// Submit one payload for causal broadcast. The broadcaster stamps it
    /// with the vector clock, transmits it to every peer, and delivers it
    /// to self directly into the local causal queue.
    pub fn broadcast(&self, content: String) -> Result<(), SessionError> {
        match self.input_tx.as_ref() {
            Some(tx) => tx.send(content).map_err(|_| SessionError::InputClosed),
            None => Err(SessionError::InputClosed),
        }
    }

    /// Close the input, run the session to its budget, perform the
    /// COMPLETE exchange, and return the engine's report.
    pub fn finish(mut self) -> Result<EngineReport<A>, SessionError> {
        drop(self.input_tx.take());

        let report = self
            .engine_handle
            .join()
            .map_err(|_| SessionError::WorkerPanicked("engine"))?;
        self.broadcaster_handle
            .join()
            .map_err(|_| SessionError::WorkerPanicked("broadcaster"))??;

        for (peer, sink) in &self.sinks {
            sink.write_line(COMPLETE)
                .map_err(|source| SessionError::Link { peer: *peer, source })?;
        }
        info!(
            "Node {}: budget exhausted, COMPLETE sent to all peers",
            self.params.node_id
        );

        for (peer, handle) in self.receiver_handles {
            handle
                .join()
                .map_err(|_| SessionError::WorkerPanicked("receiver"))?
                .map_err(|source| SessionError::Link { peer, source })?;
        }
        Ok(report)
    }
}

/// Read one peer's line stream until its COMPLETE marker.
///
/// Inbound lines are classified by shape: a sequence-number prefix routes
/// to the sequence queue, a clock prefix to the causal queue. A malformed
/// line is logged and skipped; it never takes the receiver down.
fn receiver_loop(
    params: SessionParams,
    peer: NodeId,
    mut source: Box<dyn LineSource>,
    delivery_queue: Arc<DeliveryQueue>,
    sequence_queue: Arc<SequenceQueue>,
) -> Result<(), LinkError> {
    loop {
        let line = match source.read_line()? {
            Some(line) => line,
            // EOF before COMPLETE: the peer went away mid-session.
            None => return Err(LinkError::Closed),
        };
        if line == COMPLETE {
            debug!("Node {}: node {} completed", params.node_id, peer);
            return Ok(());
        }
        debug!("Node {}: received from node {}: {}", params.node_id, peer, line);

        if message::is_sequenced_wire(&line) {
            match SequencedMessage::parse(&line, params.num_processes) {
                Ok(sm) => sequence_queue.add(sm),
                Err(e) => warn!(
                    "Node {}: dropping malformed sequenced line from node {}: {} ({:?})",
                    params.node_id, peer, e, line
                ),
            }
        } else {
            match Message::parse(&line, peer, params.num_processes) {
                Ok(m) => delivery_queue.add(m),
                Err(e) => warn!(
                    "Node {}: dropping malformed line from node {}: {} ({:?})",
                    params.node_id, peer, e, line
                ),
            }
        }
    }
}

/// Transmit payload broadcasts and (on the sequencer) sequenced lines.
///
/// Runs until both inputs are closed: the payload channel by `finish()`,
/// the sequenced channel by the engine reaching its budget.
fn broadcaster_loop(
    params: SessionParams,
    sinks: Vec<(NodeId, Arc<dyn LineSink>)>,
    input_rx: Receiver<String>,
    seq_rx: Option<Receiver<String>>,
    clock: Arc<SharedClock>,
    delivery_queue: Arc<DeliveryQueue>,
    shutdown: Arc<AtomicBool>,
) -> Result<(), SessionError> {
    let mut input_open = true;
    let mut seq_open = seq_rx.is_some();
    let mut input_rx = input_rx;
    let mut seq_rx = seq_rx.unwrap_or_else(never);
    let sequencing = params.role() == Role::Sequencing;

    while input_open || seq_open {
        select! {
            recv(seq_rx) -> line => match line {
                Ok(line) => {
                    debug!("Node {}: broadcasting sequenced {}", params.node_id, line);
                    send_to_all(&sinks, &line)?;
                }
                Err(_) => {
                    seq_open = false;
                    seq_rx = never();
                }
            },
            recv(input_rx) -> content => match content {
                Ok(content) => {
                    let stamp = clock.stamp(params.node_id);
                    let message = Message::new(stamp, params.node_id, content);
                    let line = message.to_wire();
                    info!("Node {}: broadcasting {}", params.node_id, line);
                    send_to_all(&sinks, &line)?;
                    // Self-delivery: straight into the local causal queue,
                    // no network round-trip.
                    delivery_queue.add(message.clone());
                    if sequencing {
                        hold_for_self_delivery(&delivery_queue, &message, &shutdown);
                    }
                }
                Err(_) => {
                    input_open = false;
                    input_rx = never();
                }
            },
        }
    }
    Ok(())
}

/// On the sequencer, hold the next stamp until the engine has taken this
/// self-delivered message: the deliverability predicate's own-origin rule
/// requires equality on the origin slot, so only the newest own stamp is
/// ever deliverable. Two outstanding own broadcasts would wedge the head
/// of the causal queue permanently.
fn hold_for_self_delivery(
    delivery_queue: &DeliveryQueue,
    message: &Message,
    shutdown: &AtomicBool,
) {
    loop {
        let seen = delivery_queue.version();
        if !delivery_queue.contains(message) || shutdown.load(Ordering::Relaxed) {
            return;
        }
        delivery_queue.wait_newer(seen, Duration::from_millis(10));
    }
}

fn send_to_all(sinks: &[(NodeId, Arc<dyn LineSink>)], line: &str) -> Result<(), SessionError> {
    for (peer, sink) in sinks {
        sink.write_line(line)
            .map_err(|source| SessionError::Link { peer: *peer, source })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::MemoryNetwork;

    fn params(node_id: NodeId) -> SessionParams {
        SessionParams {
            node_id,
            num_processes: 3,
            sequencer_id: 1,
            delivery_budget: 3,
        }
    }

    #[test]
    fn test_role_from_params() {
        assert_eq!(params(1).role(), Role::Sequencing);
        assert_eq!(params(2).role(), Role::Following);
    }

    #[test]
    fn test_single_broadcast_session() {
        let mut network = MemoryNetwork::new(3);

        // finish() blocks on every peer's COMPLETE, so each node session
        // runs on its own thread, as separate processes would.
        let handles: Vec<_> = (1..=3u32)
            .map(|id| {
                let links = network.take_endpoint(id).unwrap();
                thread::spawn(move || {
                    let session = start(params(id), links, ());
                    session
                        .broadcast(format!("Message no.1 from {}", id))
                        .unwrap();
                    session.finish().unwrap()
                })
            })
            .collect();

        let mut orders = Vec::new();
        for handle in handles {
            let report = handle.join().unwrap();
            assert_eq!(report.delivered, 3);
            let contents: Vec<String> =
                report.history.iter().map(|r| r.content.clone()).collect();
            orders.push(contents);
        }
        assert_eq!(orders[0], orders[1]);
        assert_eq!(orders[1], orders[2]);
    }
}
