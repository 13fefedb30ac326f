//! Cluster configuration.
//!
//! A cluster file names every process and its listen address, one per
//! line, plus optional session settings:
//!
//! ```text
//! # id = host:port
//! 1 = 10.0.0.1:7400
//! 2 = 10.0.0.2:7400
//! 3 = 10.0.0.3:7400
//! sequencer = 1
//! messages = 100
//! ```
//!
//! Blank lines and `#` comments are ignored. Ids must be contiguous from
//! 1. The same parameters can be constructed directly in code; the file
//! loader exists for the CLI.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;

use crate::broadcast::clock::NodeId;

/// Default sequencer process when the file does not elect one.
pub const DEFAULT_SEQUENCER: NodeId = 1;

/// Default broadcasts per process per session.
pub const DEFAULT_MESSAGES_PER_NODE: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Process id to listen address, densely keyed 1..=N.
    pub nodes: BTreeMap<NodeId, SocketAddr>,
    /// The process that assigns the global total order.
    pub sequencer_id: NodeId,
    /// Broadcasts each process originates per session.
    pub messages_per_node: u64,
}

impl ClusterConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(ConfigError::Io)?;
        text.parse()
    }

    pub fn num_processes(&self) -> usize {
        self.nodes.len()
    }

    pub fn addr(&self, node: NodeId) -> Option<SocketAddr> {
        self.nodes.get(&node).copied()
    }

    /// Every process except `node`, ascending.
    pub fn peers(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied().filter(move |&id| id != node)
    }

    /// Total deliveries each process performs in a session: every
    /// process's broadcasts, its own included.
    pub fn delivery_budget(&self) -> u64 {
        self.num_processes() as u64 * self.messages_per_node
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.nodes.len() < 2 {
            return Err(ConfigError::Invalid(
                "a cluster needs at least 2 processes".to_string(),
            ));
        }
        for (expected, &actual) in (1..).zip(self.nodes.keys()) {
            if expected != actual {
                return Err(ConfigError::Invalid(format!(
                    "process ids must be contiguous from 1, missing id {}",
                    expected
                )));
            }
        }
        if !self.nodes.contains_key(&self.sequencer_id) {
            return Err(ConfigError::Invalid(format!(
                "sequencer id {} is not a configured process",
                self.sequencer_id
            )));
        }
        if self.messages_per_node == 0 {
            return Err(ConfigError::Invalid(
                "messages per node must be at least 1".to_string(),
            ));
        }
        Ok(self)
    }
}

impl FromStr for ClusterConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut nodes = BTreeMap::new();
        let mut sequencer_id = DEFAULT_SEQUENCER;
        let mut messages_per_node = DEFAULT_MESSAGES_PER_NODE;

        for (idx, raw) in s.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| ConfigError::Parse {
                line_no,
                reason: "expected `key = value`".to_string(),
            })?;
            let key = key.trim();
            let value = value.trim();

            match key {
                "sequencer" => {
                    sequencer_id = value.parse().map_err(|_| ConfigError::Parse {
                        line_no,
                        reason: format!("bad sequencer id {:?}", value),
                    })?;
                }
                "messages" => {
                    messages_per_node = value.parse().map_err(|_| ConfigError::Parse {
                        line_no,
                        reason: format!("bad message count {:?}", value),
                    })?;
                }
                _ => {
                    let id: NodeId = key.parse().map_err(|_| ConfigError::Parse {
                        line_no,
                        reason: format!("bad process id {:?}", key),
                    })?;
                    let addr: SocketAddr = value.parse().map_err(|_| ConfigError::Parse {
                        line_no,
                        reason: format!("bad address {:?}", value),
                    })?;
                    if nodes.insert(id, addr).is_some() {
                        return Err(ConfigError::Parse {
                            line_no,
                            reason: format!("duplicate process id {}", id),
                        });
                    }
                }
            }
        }

        ClusterConfig {
            nodes,
            sequencer_id,
            messages_per_node,
        }
        .validate()
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Parse { line_no: usize, reason: String },
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "cannot read cluster file: {}", e),
            ConfigError::Parse { line_no, reason } => {
                write!(f, "cluster file line {}: {}", line_no, reason)
            }
            ConfigError::Invalid(reason) => write!(f, "invalid cluster: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# three local processes
1 = 127.0.0.1:7401
2 = 127.0.0.1:7402
3 = 127.0.0.1:7403

sequencer = 1
messages = 50
";

    #[test]
    fn test_parse_sample() {
        let config: ClusterConfig = SAMPLE.parse().unwrap();
        assert_eq!(config.num_processes(), 3);
        assert_eq!(config.sequencer_id, 1);
        assert_eq!(config.messages_per_node, 50);
        assert_eq!(config.delivery_budget(), 150);
        assert_eq!(
            config.addr(2),
            Some("127.0.0.1:7402".parse().unwrap())
        );
        assert_eq!(config.peers(2).collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn test_defaults() {
        let config: ClusterConfig = "1 = 127.0.0.1:7401\n2 = 127.0.0.1:7402\n"
            .parse()
            .unwrap();
        assert_eq!(config.sequencer_id, DEFAULT_SEQUENCER);
        assert_eq!(config.messages_per_node, DEFAULT_MESSAGES_PER_NODE);
    }

    #[test]
    fn test_rejects_gap_in_ids() {
        let err = "1 = 127.0.0.1:7401\n3 = 127.0.0.1:7403\n"
            .parse::<ClusterConfig>()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_unknown_sequencer() {
        let err = "1 = 127.0.0.1:7401\n2 = 127.0.0.1:7402\nsequencer = 9\n"
            .parse::<ClusterConfig>()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_malformed_line() {
        let err = "1 127.0.0.1:7401\n".parse::<ClusterConfig>().unwrap_err();
        assert!(matches!(err, ConfigError::Parse { line_no: 1, .. }));
    }

    #[test]
    fn test_rejects_single_process() {
        let err = "1 = 127.0.0.1:7401\n".parse::<ClusterConfig>().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
