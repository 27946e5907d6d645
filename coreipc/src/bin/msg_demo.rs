//! Multi-peer echo demo over the in-process fabric.
//!
//! One master node connects a packet session to each peer; peers echo every
//! message back. Mirrors the classic master/slave message exchange used to
//! smoke-test multicore transports.
//!
//! Run with:
//! ```bash
//! cargo run -p coreipc --bin msg_demo --features demo-bin -- -r 8 -p 3
//! ```

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use coreipc::{ChannelKind, Fabric, Node, NodeConfig};

const MASTER_NODE: u32 = 0;
const MASTER_PORT_BASE: u32 = 101;
const PEER_PORT: u32 = 5;

#[derive(Parser, Debug)]
#[command(name = "msg_demo")]
#[command(about = "Master/peer echo exchange over the coreipc fabric")]
struct Args {
    /// Number of rounds per peer
    #[arg(short, long, default_value = "4")]
    rounds: u32,

    /// Number of peer nodes
    #[arg(short, long, default_value = "2")]
    peers: u32,

    /// Payload size in bytes
    #[arg(short = 's', long, default_value = "64")]
    payload: usize,

    /// Per-operation timeout in milliseconds
    #[arg(short, long, default_value = "5000")]
    timeout_ms: u64,
}

fn peer_main(fabric: Arc<Fabric>, peer: u32, rounds: u32, timeout: Option<Duration>) {
    let node = Node::initialize(&fabric, 0, peer, NodeConfig::default()).unwrap();
    let local = node.endpoint_create(PEER_PORT).unwrap();
    let session = node.session_create(local, ChannelKind::Packet).unwrap();

    let master = node
        .endpoint_get(0, MASTER_NODE, MASTER_PORT_BASE + peer - 1, timeout)
        .unwrap();
    node.session_connect(session, master, MASTER_NODE, ChannelKind::Packet, timeout)
        .unwrap();

    let mut buf = vec![0u8; 65536];
    for _ in 0..rounds {
        let (len, _src) = node.recv(session, &mut buf, timeout).unwrap();
        node.send(session, &buf[..len], 0, timeout).unwrap();
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let timeout = Some(Duration::from_millis(args.timeout_ms));
    let fabric = Fabric::new();

    let peers: Vec<_> = (1..=args.peers)
        .map(|peer| {
            let fabric = fabric.clone();
            let rounds = args.rounds;
            thread::spawn(move || peer_main(fabric, peer, rounds, timeout))
        })
        .collect();

    let master = Node::initialize(&fabric, 0, MASTER_NODE, NodeConfig::default()).unwrap();
    let mut sessions = Vec::new();
    for peer in 1..=args.peers {
        let local = master
            .endpoint_create(MASTER_PORT_BASE + peer - 1)
            .unwrap();
        let session = master.session_create(local, ChannelKind::Packet).unwrap();
        let remote = master.endpoint_get(0, peer, PEER_PORT, timeout).unwrap();
        master
            .session_connect(session, remote, peer, ChannelKind::Packet, timeout)
            .unwrap();
        sessions.push((peer, session));
    }

    let mut buf = vec![0u8; 65536];
    for round in 0..args.rounds {
        for &(peer, session) in &sessions {
            let mut msg = format!("round-{round}-to-{peer}").into_bytes();
            msg.resize(args.payload.max(msg.len()), b'.');
            master.send(session, &msg, 0, timeout).unwrap();
            let (len, src) = master.recv(session, &mut buf, timeout).unwrap();
            assert_eq!(&buf[..len], &msg[..]);
            info!(round, peer, len, src = src.as_raw(), "echo verified");
        }
    }

    for handle in peers {
        handle.join().unwrap();
    }
    info!(
        peers = args.peers,
        rounds = args.rounds,
        "all echoes verified"
    );
}
