//! Broadcast integration tests: whole node sessions over in-memory links.

use std::collections::BTreeMap;
use std::thread;

use crate::app::KvStore;
use crate::net::MemoryNetwork;
use crate::verify::{self, NodeHistory};

use super::broker::{start, SessionParams};
use super::clock::NodeId;
use super::engine::EngineReport;

/// Run a whole cluster in-process: node `i` broadcasts `payloads[i - 1]`,
/// every session runs on its own thread (finish() blocks on peer
/// COMPLETEs), and every node must deliver every payload.
fn run_cluster(
    sequencer_id: NodeId,
    payloads: Vec<Vec<String>>,
) -> BTreeMap<NodeId, EngineReport<KvStore>> {
    let num_processes = payloads.len();
    let budget: u64 = payloads.iter().map(|p| p.len() as u64).sum();
    let mut network = MemoryNetwork::new(num_processes as u32);

    let handles: Vec<_> = payloads
        .into_iter()
        .enumerate()
        .map(|(idx, node_payloads)| {
            let node_id = idx as NodeId + 1;
            let links = network.take_endpoint(node_id).unwrap();
            let params = SessionParams {
                node_id,
                num_processes,
                sequencer_id,
                delivery_budget: budget,
            };
            thread::spawn(move || {
                let session = start(params, links, KvStore::new());
                for payload in node_payloads {
                    session.broadcast(payload).unwrap();
                }
                (node_id, session.finish().unwrap())
            })
        })
        .collect();

    handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect()
}

fn histories(reports: &BTreeMap<NodeId, EngineReport<KvStore>>) -> Vec<NodeHistory> {
    reports
        .iter()
        .map(|(&node_id, report)| NodeHistory {
            node_id,
            records: report.history.clone(),
        })
        .collect()
}

/// Test: three processes, one broadcast each, sequencer = 1.
///
/// Every node must deliver all three messages in the same order, and the
/// full verification pass (agreement, sequence continuity, per-origin
/// FIFO, causal safety) must come back clean.
#[test]
fn test_three_process_agreement() {
    let reports = run_cluster(
        1,
        (1..=3)
            .map(|id| vec![format!("Message no.1 from {}", id)])
            .collect(),
    );

    for report in reports.values() {
        assert_eq!(report.delivered, 3);
        assert_eq!(report.anomalies, 0);
    }
    let report = verify::verify(&histories(&reports));
    assert!(report.is_clean(), "{}", report);
}

/// Test: five processes, ten broadcasts each, under concurrent load.
#[test]
fn test_five_process_stress_agreement() {
    let payloads: Vec<Vec<String>> = (1..=5)
        .map(|id| {
            (1..=10)
                .map(|k| format!("Message no.{} from {}", k, id))
                .collect()
        })
        .collect();
    let reports = run_cluster(1, payloads);

    for report in reports.values() {
        assert_eq!(report.delivered, 50);
    }
    let report = verify::verify(&histories(&reports));
    assert!(report.is_clean(), "{}", report);

    // Everyone saw the same global order, so spot-check it is literally
    // identical between the sequencer and a follower.
    let sequencer_order: Vec<&str> = reports[&1].history.iter().map(|r| r.content.as_str()).collect();
    let follower_order: Vec<&str> = reports[&4].history.iter().map(|r| r.content.as_str()).collect();
    assert_eq!(sequencer_order, follower_order);
}

/// Test: two messages in a row from one origin are delivered in send
/// order at every receiver, even though nothing else is in flight.
#[test]
fn test_back_to_back_messages_keep_fifo_order() {
    let reports = run_cluster(
        1,
        vec![
            vec![],
            vec!["A".to_string(), "A2".to_string()],
            vec![],
        ],
    );

    for report in reports.values() {
        let contents: Vec<&str> = report.history.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(contents, vec!["A", "A2"]);
    }
}

/// Test: replicated state machines converge.
///
/// Writes from different origins are applied in the agreed order, so the
/// final key-value state is identical on every node, including the
/// last-writer-wins outcome for the contended key.
#[test]
fn test_kv_states_converge() {
    let reports = run_cluster(
        1,
        vec![
            vec!["WRITE shared one".to_string(), "WRITE a 1".to_string()],
            vec!["WRITE shared two".to_string(), "WRITE b 2".to_string()],
            vec!["WRITE shared three".to_string(), "WRITE c 3".to_string()],
        ],
    );

    let winner = reports[&1].app.get("shared").unwrap().to_string();
    for report in reports.values() {
        assert_eq!(report.app.applied_writes(), 6);
        assert_eq!(report.app.get("shared"), Some(winner.as_str()));
        assert_eq!(report.app.get("a"), Some("1"));
        assert_eq!(report.app.get("b"), Some("2"));
        assert_eq!(report.app.get("c"), Some("3"));
    }
}

/// Test: a malformed line is logged and skipped, not fatal.
///
/// Garbage is injected on the node 2 → node 1 link before the session
/// traffic; the session must still complete and agree.
#[test]
fn test_malformed_line_is_skipped() {
    let num_processes = 3;
    let budget = 3u64;
    let mut network = MemoryNetwork::new(3);

    let mut endpoints: BTreeMap<NodeId, _> = (1..=3)
        .map(|id| (id, network.take_endpoint(id).unwrap()))
        .collect();

    // Node 2 speaks garbage first.
    {
        let ep2 = endpoints.get_mut(&2).unwrap();
        let to_one = ep2.iter().find(|l| l.peer == 1).unwrap();
        to_one.sink.write_line("0,banana,0:not a clock").unwrap();
        to_one.sink.write_line("no delimiters at all").unwrap();
    }

    let handles: Vec<_> = (1..=3u32)
        .map(|node_id| {
            let links = endpoints.remove(&node_id).unwrap();
            let params = SessionParams {
                node_id,
                num_processes,
                sequencer_id: 1,
                delivery_budget: budget,
            };
            thread::spawn(move || {
                let session = start(params, links, ());
                session
                    .broadcast(format!("Message no.1 from {}", node_id))
                    .unwrap();
                (node_id, session.finish().unwrap())
            })
        })
        .collect();

    let reports: BTreeMap<NodeId, EngineReport<()>> =
        handles.into_iter().map(|h| h.join().unwrap()).collect();
    for report in reports.values() {
        assert_eq!(report.delivered, 3);
    }
}

/// Test: a vanished peer is a fatal session error, not a hang.
///
/// Node 3's endpoint is dropped without ever starting a session; nodes 1
/// and 2 observe end-of-stream, abort, and surface the link failure.
#[test]
fn test_missing_peer_fails_the_session() {
    let mut network = MemoryNetwork::new(3);
    let ep1 = network.take_endpoint(1).unwrap();
    let ep2 = network.take_endpoint(2).unwrap();
    drop(network.take_endpoint(3).unwrap());

    let handles: Vec<_> = [(1u32, ep1), (2u32, ep2)]
        .into_iter()
        .map(|(node_id, links)| {
            let params = SessionParams {
                node_id,
                num_processes: 3,
                sequencer_id: 1,
                delivery_budget: 3,
            };
            thread::spawn(move || {
                let session = start(params, links, ());
                // The broadcast may already observe the dead link.
                let _ = session.broadcast(format!("Message no.1 from {}", node_id));
                session.finish()
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.join().unwrap().is_err());
    }
}
