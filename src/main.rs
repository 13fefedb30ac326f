mod app;
mod broadcast;
mod config;
mod net;
mod verify;

use std::env;
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::info;
use rand::Rng;

use app::KvStore;
use broadcast::{NodeId, SessionParams};
use config::ClusterConfig;
use net::establisher;

/// Broadcasts per node in `demo` mode.
const DEMO_MESSAGES: u64 = 5;

fn main() {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("run") => {
            if args.len() != 4 {
                print_usage();
                process::exit(2);
            }
            run_node(Path::new(&args[2]), &args[3]);
        }
        Some("demo") => {
            let num_processes = match args.get(2) {
                Some(n) => match n.parse::<u32>() {
                    Ok(n) if n >= 2 => n,
                    _ => {
                        eprintln!("demo needs at least 2 processes");
                        process::exit(2);
                    }
                },
                None => 3,
            };
            run_demo(num_processes);
        }
        Some("verify") => {
            if args.len() != 3 {
                print_usage();
                process::exit(2);
            }
            run_verify(Path::new(&args[2]));
        }
        _ => {
            print_usage();
            process::exit(2);
        }
    }
}

fn print_usage() {
    eprintln!("Usage: totem <command>");
    eprintln!("Commands:");
    eprintln!("  run <cluster-file> <node-id>  - run one node of a TCP cluster");
    eprintln!("  demo [n]                      - run an n-process cluster in-process (default 3)");
    eprintln!("  verify <dir>                  - cross-check delivery histories in a directory");
}

/// Run one node of a real cluster: establish links, broadcast the
/// configured workload, run to the delivery budget, persist the history.
fn run_node(cluster_file: &Path, node_arg: &str) {
    let node_id: NodeId = match node_arg.parse() {
        Ok(id) => id,
        Err(_) => {
            eprintln!("bad node id {:?}", node_arg);
            process::exit(2);
        }
    };
    let config = match ClusterConfig::from_file(cluster_file) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: {}", e);
            process::exit(1);
        }
    };

    init_logging(Some(&PathBuf::from(format!("totem-node-{}.log", node_id))));

    let links = match establisher::establish(&config, node_id) {
        Ok(links) => links,
        Err(e) => {
            eprintln!("FATAL: {}", e);
            process::exit(1);
        }
    };

    let params = SessionParams {
        node_id,
        num_processes: config.num_processes(),
        sequencer_id: config.sequencer_id,
        delivery_budget: config.delivery_budget(),
    };
    let session = broadcast::start(params, links, KvStore::new());

    // Workload: the configured number of broadcasts, with a short random
    // pause between sends so the interleaving differs across nodes.
    let mut rng = rand::thread_rng();
    for k in 1..=config.messages_per_node {
        let payload = format!("Message no.{} from {}", k, node_id);
        if session.broadcast(payload).is_err() {
            // The session is failing; finish() reports the cause.
            break;
        }
        thread::sleep(Duration::from_millis(rng.gen_range(30..40)));
    }

    match session.finish() {
        Ok(report) => {
            let out = match verify::write_history(Path::new("."), node_id, &report.history) {
                Ok(path) => path,
                Err(e) => {
                    eprintln!("FATAL: cannot persist delivery history: {}", e);
                    process::exit(1);
                }
            };
            info!(
                "Node {}: delivered {} messages, {} anomalies, history in {}",
                node_id,
                report.delivered,
                report.anomalies,
                out.display()
            );
            println!(
                "Node {} done: {} delivered, {} writes applied",
                node_id,
                report.delivered,
                report.app.applied_writes()
            );
        }
        Err(e) => {
            eprintln!("FATAL: session failed: {}", e);
            process::exit(1);
        }
    }
}

/// Run a whole cluster in-process over memory links and print the agreed
/// delivery order.
fn run_demo(num_processes: u32) {
    init_logging(None);

    let mut network = net::MemoryNetwork::new(num_processes);
    let budget = num_processes as u64 * DEMO_MESSAGES;

    let handles: Vec<_> = (1..=num_processes)
        .map(|node_id| {
            let links = network.take_endpoint(node_id).unwrap();
            let params = SessionParams {
                node_id,
                num_processes: num_processes as usize,
                sequencer_id: 1,
                delivery_budget: budget,
            };
            thread::spawn(move || {
                let session = broadcast::start(params, links, ());
                let mut rng = rand::thread_rng();
                for k in 1..=DEMO_MESSAGES {
                    session
                        .broadcast(format!("Message no.{} from {}", k, node_id))
                        .expect("demo session lost its broadcaster");
                    thread::sleep(Duration::from_millis(rng.gen_range(5..15)));
                }
                let report = session.finish().expect("demo session failed");
                (node_id, report)
            })
        })
        .collect();

    let mut histories = Vec::new();
    for handle in handles {
        let (node_id, report) = handle.join().expect("demo node panicked");
        histories.push(verify::NodeHistory {
            node_id,
            records: report.history,
        });
    }
    histories.sort_by_key(|h| h.node_id);

    println!("Agreed delivery order ({} processes):", num_processes);
    for record in &histories[0].records {
        println!("  {:>3}. [{}] {}", record.sequence_no, record.clock, record.content);
    }

    let report = verify::verify(&histories);
    println!("{}", report);
    if !report.is_clean() {
        process::exit(1);
    }
}

fn run_verify(dir: &Path) {
    match verify::verify_dir(dir) {
        Ok(report) => {
            println!("{}", report);
            if !report.is_clean() {
                process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("FATAL: {}", e);
            process::exit(1);
        }
    }
}

/// Log to stderr, and to a per-node file in `run` mode. Delivery lines
/// (`Delivered: ...`) go through this pipeline, so a node's log file is
/// the offline-verifiable record the protocol promises.
fn init_logging(log_file: Option<&Path>) {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                format_epoch_millis(),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log::LevelFilter::Info)
        .chain(std::io::stderr());
    if let Some(path) = log_file {
        match fern::log_file(path) {
            Ok(file) => dispatch = dispatch.chain(file),
            Err(e) => {
                eprintln!("FATAL: cannot open log file {}: {}", path.display(), e);
                process::exit(1);
            }
        }
    }
    dispatch.apply().expect("logger initialized twice");
}

fn format_epoch_millis() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:03}", now.as_secs(), now.subsec_millis())
}
