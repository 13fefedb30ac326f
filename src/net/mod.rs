//! Peer links: newline-delimited UTF-8 line streams, one pair per peer.
//!
//! The broadcast core only requires, per peer, a writable line sink and a
//! readable line source that are FIFO and reliable for the run. Two
//! implementations exist: buffered TCP streams for real deployments, and
//! crossbeam channels for in-process clusters (tests and the demo).
//!
//! Writers are shared (the broadcaster and the completion exchange both
//! write); readers are owned by that peer's receiver thread.

pub mod establisher;

use std::collections::HashMap;
use std::fmt;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::broadcast::clock::NodeId;

/// A line-stream failure. Fatal to the affected peer's pump thread; the
/// core does not reconnect.
#[derive(Debug)]
pub enum LinkError {
    /// The peer closed the stream before the session finished.
    Closed,
    Io(io::Error),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::Closed => write!(f, "peer closed the link"),
            LinkError::Io(e) => write!(f, "link I/O error: {}", e),
        }
    }
}

impl std::error::Error for LinkError {}

impl From<io::Error> for LinkError {
    fn from(e: io::Error) -> Self {
        LinkError::Io(e)
    }
}

/// Shared, thread-safe line sink.
pub trait LineSink: Send + Sync {
    fn write_line(&self, line: &str) -> Result<(), LinkError>;
}

/// Blocking line source. `Ok(None)` is end-of-stream.
pub trait LineSource: Send {
    fn read_line(&mut self) -> Result<Option<String>, LinkError>;
}

/// A bidirectional line channel to one peer.
pub struct Link {
    pub peer: NodeId,
    pub sink: Arc<dyn LineSink>,
    pub source: Box<dyn LineSource>,
}

impl Link {
    /// Wrap an established TCP stream. The stream is cloned so reads and
    /// writes move independently; writes are line-buffered and flushed
    /// per line.
    pub fn from_tcp(peer: NodeId, stream: TcpStream) -> io::Result<Link> {
        let write_half = stream.try_clone()?;
        Ok(Link {
            peer,
            sink: Arc::new(TcpLineSink {
                writer: Mutex::new(BufWriter::new(write_half)),
            }),
            source: Box::new(TcpLineSource {
                reader: BufReader::new(stream),
            }),
        })
    }
}

struct TcpLineSink {
    writer: Mutex<BufWriter<TcpStream>>,
}

impl LineSink for TcpLineSink {
    fn write_line(&self, line: &str) -> Result<(), LinkError> {
        let mut writer = self.writer.lock().unwrap();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

struct TcpLineSource {
    reader: BufReader<TcpStream>,
}

impl LineSource for TcpLineSource {
    fn read_line(&mut self) -> Result<Option<String>, LinkError> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }
}

struct ChannelLineSink {
    tx: Sender<String>,
}

impl LineSink for ChannelLineSink {
    fn write_line(&self, line: &str) -> Result<(), LinkError> {
        self.tx.send(line.to_string()).map_err(|_| LinkError::Closed)
    }
}

struct ChannelLineSource {
    rx: Receiver<String>,
}

impl LineSource for ChannelLineSource {
    fn read_line(&mut self) -> Result<Option<String>, LinkError> {
        match self.rx.recv() {
            Ok(line) => Ok(Some(line)),
            // All senders dropped: clean end-of-stream.
            Err(_) => Ok(None),
        }
    }
}

/// An in-process full mesh over crossbeam channels, the counterpart of a
/// TCP cluster for tests and the demo.
pub struct MemoryNetwork {
    endpoints: HashMap<NodeId, Vec<Link>>,
}

impl MemoryNetwork {
    /// Build a mesh for processes `1..=num_processes`.
    pub fn new(num_processes: u32) -> Self {
        let mut inboxes: HashMap<(NodeId, NodeId), (Sender<String>, Receiver<String>)> =
            HashMap::new();
        for a in 1..=num_processes {
            for b in 1..=num_processes {
                if a != b {
                    // Channel carrying lines from a to b.
                    inboxes.insert((a, b), unbounded());
                }
            }
        }

        let mut endpoints: HashMap<NodeId, Vec<Link>> = HashMap::new();
        for node in 1..=num_processes {
            let mut links = Vec::new();
            for peer in 1..=num_processes {
                if peer == node {
                    continue;
                }
                let tx = inboxes[&(node, peer)].0.clone();
                let rx = inboxes[&(peer, node)].1.clone();
                links.push(Link {
                    peer,
                    sink: Arc::new(ChannelLineSink { tx }),
                    source: Box::new(ChannelLineSource { rx }),
                });
            }
            endpoints.insert(node, links);
        }
        MemoryNetwork { endpoints }
    }

    /// Take the links for one node. Can only be taken once per node.
    pub fn take_endpoint(&mut self, node: NodeId) -> Option<Vec<Link>> {
        self.endpoints.remove(&node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_network_delivers_lines_in_order() {
        let mut network = MemoryNetwork::new(3);
        let ep1 = network.take_endpoint(1).unwrap();
        let mut ep2 = network.take_endpoint(2).unwrap();

        let to_two = ep1.iter().find(|l| l.peer == 2).unwrap();
        to_two.sink.write_line("first").unwrap();
        to_two.sink.write_line("second").unwrap();

        let from_one = ep2.iter_mut().find(|l| l.peer == 1).unwrap();
        assert_eq!(from_one.source.read_line().unwrap(), Some("first".to_string()));
        assert_eq!(from_one.source.read_line().unwrap(), Some("second".to_string()));
    }

    #[test]
    fn test_memory_link_eof_when_sender_dropped() {
        let mut network = MemoryNetwork::new(2);
        let ep1 = network.take_endpoint(1).unwrap();
        let mut ep2 = network.take_endpoint(2).unwrap();

        drop(ep1);
        let from_one = ep2.iter_mut().find(|l| l.peer == 1).unwrap();
        assert_eq!(from_one.source.read_line().unwrap(), None);
    }

    #[test]
    fn test_endpoint_taken_once() {
        let mut network = MemoryNetwork::new(2);
        assert!(network.take_endpoint(1).is_some());
        assert!(network.take_endpoint(1).is_none());
    }
}
