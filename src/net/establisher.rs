//! Pairwise TCP link establishment.
//!
//! Every process listens on its configured address, dials every peer with
//! a higher id (bounded retries, fixed backoff) and accepts connections
//! from every peer with a lower id, so each unordered pair ends up with
//! exactly one stream. The dialer announces itself with a single
//! `ID <n>` line; pairing by announcement, unlike pairing by source
//! address, still works when several processes share a host.
//!
//! Once every link is up, the `READY` rendezvous runs: send `READY` on
//! all links, then block until `READY` has been read from all links.
//! Core traffic starts only after the rendezvous, so no broadcast line
//! can reach a process that is still establishing.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use log::{info, warn};

use super::{Link, LinkError};
use crate::broadcast::clock::NodeId;
use crate::config::ClusterConfig;

const DIAL_ATTEMPTS: u32 = 5;
const DIAL_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Rendezvous line exchanged once per link before core traffic.
pub const READY: &str = "READY";

/// Establish one link per peer and complete the READY rendezvous.
///
/// Returns the links ascending by peer id.
pub fn establish(config: &ClusterConfig, self_id: NodeId) -> Result<Vec<Link>, EstablishError> {
    let own_addr = config
        .addr(self_id)
        .ok_or(EstablishError::UnknownSelf(self_id))?;
    let listener = TcpListener::bind(own_addr).map_err(|source| EstablishError::Bind {
        addr: own_addr.to_string(),
        source,
    })?;
    info!("Node {}: listening on {}", self_id, own_addr);

    let mut links: Vec<Link> = Vec::with_capacity(config.num_processes() - 1);

    // Dial everyone above us; they are (or will be) listening.
    for peer in config.peers(self_id).filter(|&p| p > self_id) {
        let stream = dial(config, self_id, peer)?;
        links.push(Link::from_tcp(peer, stream).map_err(EstablishError::Socket)?);
    }

    // Accept everyone below us, pairing each connection by its ID line.
    let expected_lower = config.peers(self_id).filter(|&p| p < self_id).count();
    let mut accepted = 0;
    while accepted < expected_lower {
        let (stream, remote) = listener.accept().map_err(EstablishError::Accept)?;
        let peer = match read_id_line(&stream) {
            Ok(peer) => peer,
            Err(e) => {
                warn!(
                    "Node {}: rejecting connection from {}: {}",
                    self_id, remote, e
                );
                continue;
            }
        };
        if peer >= self_id || config.addr(peer).is_none() || links.iter().any(|l| l.peer == peer) {
            warn!(
                "Node {}: rejecting connection from {} announcing id {}",
                self_id, remote, peer
            );
            continue;
        }
        stream.set_nodelay(true).map_err(EstablishError::Socket)?;
        links.push(Link::from_tcp(peer, stream).map_err(EstablishError::Socket)?);
        info!("Node {}: accepted connection from node {}", self_id, peer);
        accepted += 1;
    }

    links.sort_by_key(|l| l.peer);
    info!("Node {}: all {} links established", self_id, links.len());

    ready_rendezvous(self_id, &mut links)?;
    info!("Node {}: cluster is ready", self_id);
    Ok(links)
}

fn dial(config: &ClusterConfig, self_id: NodeId, peer: NodeId) -> Result<TcpStream, EstablishError> {
    let addr = config.addr(peer).expect("peer comes from the config");
    let mut last_err = None;
    for attempt in 1..=DIAL_ATTEMPTS {
        match TcpStream::connect(addr) {
            Ok(mut stream) => {
                stream.set_nodelay(true).map_err(|source| EstablishError::Dial {
                    peer,
                    attempts: attempt,
                    source,
                })?;
                stream
                    .write_all(format!("ID {}\n", self_id).as_bytes())
                    .map_err(|source| EstablishError::Dial {
                        peer,
                        attempts: attempt,
                        source,
                    })?;
                info!("Node {}: connected to node {}", self_id, peer);
                return Ok(stream);
            }
            Err(e) => {
                warn!(
                    "Node {}: dial to node {} failed (attempt {}/{}): {}",
                    self_id, peer, attempt, DIAL_ATTEMPTS, e
                );
                last_err = Some(e);
                if attempt < DIAL_ATTEMPTS {
                    thread::sleep(DIAL_RETRY_DELAY);
                }
            }
        }
    }
    Err(EstablishError::Dial {
        peer,
        attempts: DIAL_ATTEMPTS,
        source: last_err.expect("at least one attempt failed"),
    })
}

/// Read the dialer's `ID <n>` announcement byte-by-byte so no stream data
/// beyond the first line is consumed; the link's own buffered reader takes
/// over afterwards.
fn read_id_line(mut stream: &TcpStream) -> Result<NodeId, EstablishError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).map_err(EstablishError::Accept)?;
        if n == 0 {
            return Err(EstablishError::Handshake(
                "stream closed before the ID line".to_string(),
            ));
        }
        if byte[0] == b'\n' {
            break;
        }
        if line.len() > 64 {
            return Err(EstablishError::Handshake("oversized ID line".to_string()));
        }
        line.push(byte[0]);
    }
    let text = String::from_utf8(line)
        .map_err(|_| EstablishError::Handshake("ID line is not UTF-8".to_string()))?;
    let id = text
        .trim()
        .strip_prefix("ID ")
        .and_then(|rest| rest.trim().parse::<NodeId>().ok())
        .ok_or_else(|| EstablishError::Handshake(format!("bad ID line {:?}", text)))?;
    Ok(id)
}

fn ready_rendezvous(self_id: NodeId, links: &mut [Link]) -> Result<(), EstablishError> {
    for link in links.iter() {
        link.sink
            .write_line(READY)
            .map_err(|e| EstablishError::Rendezvous { peer: link.peer, source: e })?;
    }
    // Sequential blocking reads are fine here: lines sent before we get
    // to a link sit in the OS buffer.
    for link in links.iter_mut() {
        loop {
            match link.source.read_line() {
                Ok(Some(line)) if line == READY => break,
                Ok(Some(other)) => {
                    warn!(
                        "Node {}: ignoring pre-ready line from node {}: {:?}",
                        self_id, link.peer, other
                    );
                }
                Ok(None) => {
                    return Err(EstablishError::Rendezvous {
                        peer: link.peer,
                        source: LinkError::Closed,
                    })
                }
                Err(e) => {
                    return Err(EstablishError::Rendezvous {
                        peer: link.peer,
                        source: e,
                    })
                }
            }
        }
    }
    Ok(())
}

#[derive(Debug)]
pub enum EstablishError {
    UnknownSelf(NodeId),
    Bind { addr: String, source: io::Error },
    Dial { peer: NodeId, attempts: u32, source: io::Error },
    Accept(io::Error),
    Socket(io::Error),
    Handshake(String),
    Rendezvous { peer: NodeId, source: LinkError },
}

impl fmt::Display for EstablishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EstablishError::UnknownSelf(id) => {
                write!(f, "node id {} is not in the cluster config", id)
            }
            EstablishError::Bind { addr, source } => {
                write!(f, "cannot listen on {}: {}", addr, source)
            }
            EstablishError::Dial { peer, attempts, source } => {
                write!(f, "cannot reach node {} after {} attempts: {}", peer, attempts, source)
            }
            EstablishError::Accept(e) => write!(f, "accept failed: {}", e),
            EstablishError::Socket(e) => write!(f, "socket setup failed: {}", e),
            EstablishError::Handshake(reason) => write!(f, "handshake failed: {}", reason),
            EstablishError::Rendezvous { peer, source } => {
                write!(f, "READY exchange with node {} failed: {}", peer, source)
            }
        }
    }
}

impl std::error::Error for EstablishError {}
