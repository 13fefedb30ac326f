//! Offline verification of a finished session.
//!
//! Each node run writes its ordered delivery history to
//! `deliveries-<id>.bin`. The verifier loads every history in a directory
//! and checks the protocol's observable guarantees:
//!
//! 1. **Total order agreement**: all nodes delivered the same messages in
//!    the same order.
//! 2. **Sequence continuity**: delivery `k` carries sequence number `k`.
//! 3. **Per-origin FIFO**: each origin's messages appear in send order.
//! 4. **Causal safety**: no delivery is causally before an earlier one.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::app::DeliveryRecord;
use crate::broadcast::clock::{ClockOrder, NodeId};

const HISTORY_PREFIX: &str = "deliveries-";
const HISTORY_SUFFIX: &str = ".bin";

/// One node's recorded session, as persisted after a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHistory {
    pub node_id: NodeId,
    pub records: Vec<DeliveryRecord>,
}

/// File name for one node's history.
pub fn history_file_name(node_id: NodeId) -> String {
    format!("{}{}{}", HISTORY_PREFIX, node_id, HISTORY_SUFFIX)
}

/// Persist a node's delivery history under `dir`.
pub fn write_history(
    dir: &Path,
    node_id: NodeId,
    records: &[DeliveryRecord],
) -> Result<PathBuf, VerifyError> {
    let history = NodeHistory {
        node_id,
        records: records.to_vec(),
    };
    let bytes = bincode::serialize(&history).map_err(VerifyError::Encoding)?;
    let path = dir.join(history_file_name(node_id));
    fs::write(&path, bytes).map_err(VerifyError::Io)?;
    Ok(path)
}

pub fn read_history(path: &Path) -> Result<NodeHistory, VerifyError> {
    let bytes = fs::read(path).map_err(VerifyError::Io)?;
    bincode::deserialize(&bytes).map_err(VerifyError::Encoding)
}

/// Load every history file in `dir`, ascending by node id.
pub fn load_dir(dir: &Path) -> Result<Vec<NodeHistory>, VerifyError> {
    let mut histories = Vec::new();
    for entry in fs::read_dir(dir).map_err(VerifyError::Io)? {
        let entry = entry.map_err(VerifyError::Io)?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(HISTORY_PREFIX) && name.ends_with(HISTORY_SUFFIX) {
            histories.push(read_history(&entry.path())?);
        }
    }
    histories.sort_by_key(|h| h.node_id);
    if histories.len() < 2 {
        return Err(VerifyError::NotEnoughHistories(histories.len()));
    }
    Ok(histories)
}

/// Load and verify a directory of histories.
pub fn verify_dir(dir: &Path) -> Result<VerifyReport, VerifyError> {
    Ok(verify(&load_dir(dir)?))
}

/// Check every guarantee across the given histories.
pub fn verify(histories: &[NodeHistory]) -> VerifyReport {
    let mut findings = Vec::new();

    let reference = &histories[0];
    for history in &histories[1..] {
        if history.records.len() != reference.records.len() {
            findings.push(Finding::LengthMismatch {
                node: history.node_id,
                expected: reference.records.len(),
                found: history.records.len(),
            });
        }
        for (index, (expected, found)) in
            reference.records.iter().zip(&history.records).enumerate()
        {
            if expected.content != found.content || expected.origin != found.origin {
                findings.push(Finding::OrderDivergence {
                    node: history.node_id,
                    index,
                    expected: expected.content.clone(),
                    found: found.content.clone(),
                });
                // The first divergence is the interesting one per node.
                break;
            }
        }
    }

    for history in histories {
        check_node_local(history, &mut findings);
    }

    VerifyReport {
        nodes: histories.len(),
        deliveries: reference.records.len(),
        findings,
    }
}

fn check_node_local(history: &NodeHistory, findings: &mut Vec<Finding>) {
    for (index, record) in history.records.iter().enumerate() {
        let position = index as u64 + 1;
        if record.sequence_no != position {
            findings.push(Finding::SequenceGap {
                node: history.node_id,
                index,
                found: record.sequence_no,
            });
        }
    }

    // Per-origin FIFO: an origin's own clock slot counts its sends, so
    // deliveries from one origin must carry strictly increasing values
    // in that slot.
    for (index, record) in history.records.iter().enumerate() {
        let slot = match record.origin.checked_sub(1) {
            Some(slot) if (slot as usize) < record.clock.len() => slot as usize,
            // An out-of-range origin in a hand-edited file; the agreement
            // checks still apply to it.
            _ => continue,
        };
        let own = record.clock.component(slot);
        for earlier in &history.records[..index] {
            if earlier.origin == record.origin && earlier.clock.component(slot) >= own {
                findings.push(Finding::FifoViolation {
                    node: history.node_id,
                    origin: record.origin,
                    index,
                });
                break;
            }
        }
    }

    // Causal safety: nothing delivered later may be causally before
    // something delivered earlier.
    for (later_idx, later) in history.records.iter().enumerate() {
        for (earlier_idx, earlier) in history.records[..later_idx].iter().enumerate() {
            if later.clock.compare(&earlier.clock) == ClockOrder::Before {
                findings.push(Finding::CausalViolation {
                    node: history.node_id,
                    earlier: earlier_idx,
                    later: later_idx,
                });
            }
        }
    }
}

/// Outcome of a verification pass.
#[derive(Debug)]
pub struct VerifyReport {
    pub nodes: usize,
    pub deliveries: usize,
    pub findings: Vec<Finding>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

impl fmt::Display for VerifyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            write!(
                f,
                "{} nodes agree on {} deliveries",
                self.nodes, self.deliveries
            )
        } else {
            writeln!(
                f,
                "{} nodes, {} deliveries, {} finding(s):",
                self.nodes,
                self.deliveries,
                self.findings.len()
            )?;
            for finding in &self.findings {
                writeln!(f, "  {}", finding)?;
            }
            Ok(())
        }
    }
}

/// A single violated guarantee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    LengthMismatch { node: NodeId, expected: usize, found: usize },
    OrderDivergence { node: NodeId, index: usize, expected: String, found: String },
    SequenceGap { node: NodeId, index: usize, found: u64 },
    FifoViolation { node: NodeId, origin: NodeId, index: usize },
    CausalViolation { node: NodeId, earlier: usize, later: usize },
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Finding::LengthMismatch { node, expected, found } => write!(
                f,
                "node {} delivered {} messages, reference delivered {}",
                node, found, expected
            ),
            Finding::OrderDivergence { node, index, expected, found } => write!(
                f,
                "node {} diverges at delivery {}: expected {:?}, found {:?}",
                node, index, expected, found
            ),
            Finding::SequenceGap { node, index, found } => write!(
                f,
                "node {} delivery {} carries sequence number {}",
                node, index, found
            ),
            Finding::FifoViolation { node, origin, index } => write!(
                f,
                "node {} delivery {} breaks FIFO order for origin {}",
                node, index, origin
            ),
            Finding::CausalViolation { node, earlier, later } => write!(
                f,
                "node {} delivered {} before {} despite causal order",
                node, later, earlier
            ),
        }
    }
}

#[derive(Debug)]
pub enum VerifyError {
    Io(io::Error),
    Encoding(bincode::Error),
    /// Verification needs at least two histories to compare.
    NotEnoughHistories(usize),
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyError::Io(e) => write!(f, "cannot read history: {}", e),
            VerifyError::Encoding(e) => write!(f, "cannot decode history: {}", e),
            VerifyError::NotEnoughHistories(n) => {
                write!(f, "found {} history file(s), need at least 2", n)
            }
        }
    }
}

impl std::error::Error for VerifyError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::clock::VectorClock;

    fn record(seq: u64, origin: NodeId, clock: &str, content: &str) -> DeliveryRecord {
        DeliveryRecord {
            sequence_no: seq,
            origin,
            clock: clock.parse::<VectorClock>().unwrap(),
            content: content.to_string(),
        }
    }

    fn agreed_histories() -> Vec<NodeHistory> {
        let records = vec![
            record(1, 2, "0,1,0", "A"),
            record(2, 3, "0,0,1", "B"),
            record(3, 2, "0,2,1", "C"),
        ];
        (1..=3)
            .map(|node_id| NodeHistory {
                node_id,
                records: records.clone(),
            })
            .collect()
    }

    #[test]
    fn test_agreeing_histories_are_clean() {
        let report = verify(&agreed_histories());
        assert!(report.is_clean(), "unexpected findings: {}", report);
        assert_eq!(report.nodes, 3);
        assert_eq!(report.deliveries, 3);
    }

    #[test]
    fn test_detects_order_divergence() {
        let mut histories = agreed_histories();
        histories[2].records.swap(0, 1);
        let report = verify(&histories);
        assert!(report
            .findings
            .iter()
            .any(|f| matches!(f, Finding::OrderDivergence { node: 3, index: 0, .. })));
    }

    #[test]
    fn test_detects_missing_delivery() {
        let mut histories = agreed_histories();
        histories[1].records.pop();
        let report = verify(&histories);
        assert!(report
            .findings
            .iter()
            .any(|f| matches!(f, Finding::LengthMismatch { node: 2, .. })));
    }

    #[test]
    fn test_detects_fifo_violation() {
        let records = vec![
            record(1, 2, "0,2,0", "second from 2"),
            record(2, 2, "0,1,0", "first from 2"),
        ];
        let histories = vec![
            NodeHistory { node_id: 1, records: records.clone() },
            NodeHistory { node_id: 2, records },
        ];
        let report = verify(&histories);
        assert!(report
            .findings
            .iter()
            .any(|f| matches!(f, Finding::FifoViolation { origin: 2, .. })));
        // A FIFO reversal is also a causal violation.
        assert!(report
            .findings
            .iter()
            .any(|f| matches!(f, Finding::CausalViolation { .. })));
    }

    #[test]
    fn test_detects_sequence_gap() {
        let records = vec![record(1, 2, "0,1,0", "A"), record(3, 3, "0,1,1", "B")];
        let histories = vec![
            NodeHistory { node_id: 1, records: records.clone() },
            NodeHistory { node_id: 2, records },
        ];
        let report = verify(&histories);
        assert!(report
            .findings
            .iter()
            .any(|f| matches!(f, Finding::SequenceGap { index: 1, found: 3, .. })));
    }

    #[test]
    fn test_history_file_round_trip() {
        let dir = std::env::temp_dir().join("totem_verify_test");
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();

        for history in agreed_histories() {
            write_history(&dir, history.node_id, &history.records).unwrap();
        }

        let report = verify_dir(&dir).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.nodes, 3);

        let _ = fs::remove_dir_all(&dir);
    }
}
