//! Benchmark for blocking round-trip latency between two nodes.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use coreipc::{ChannelKind, Fabric, Node, NodeConfig};

fn pin_to_core(core_id: usize) {
    core_affinity::set_for_current(core_affinity::CoreId { id: core_id });
}

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

fn bench_packet_pingpong(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_pingpong");
    group.throughput(Throughput::Elements(1));

    for &size in &[8usize, 64, 512] {
        group.bench_function(format!("{}b", size), |b| {
            let fabric = Fabric::new();
            let stop = Arc::new(AtomicBool::new(false));

            let echo_fabric = fabric.clone();
            let echo_stop = stop.clone();
            let echo = thread::spawn(move || {
                pin_to_core(1);
                let node = Node::initialize(&echo_fabric, 0, 1, NodeConfig::default()).unwrap();
                let local = node.endpoint_create(5).unwrap();
                let session = node.session_create(local, ChannelKind::Packet).unwrap();
                let master = node.endpoint_get(0, 0, 101, TIMEOUT).unwrap();
                node.session_connect(session, master, 0, ChannelKind::Packet, TIMEOUT)
                    .unwrap();
                let mut buf = vec![0u8; 4096];
                while !echo_stop.load(Ordering::Relaxed) {
                    match node.recv(session, &mut buf, Some(Duration::from_millis(50))) {
                        Ok((len, _)) => {
                            node.send(session, &buf[..len], 0, TIMEOUT).unwrap();
                        }
                        Err(_) => continue,
                    }
                }
            });

            let node = Node::initialize(&fabric, 0, 0, NodeConfig::default()).unwrap();
            let local = node.endpoint_create(101).unwrap();
            let session = node.session_create(local, ChannelKind::Packet).unwrap();
            let remote = node.endpoint_get(0, 1, 5, TIMEOUT).unwrap();
            node.session_connect(session, remote, 1, ChannelKind::Packet, TIMEOUT)
                .unwrap();

            pin_to_core(0);
            let payload = vec![0xabu8; size];
            let mut buf = vec![0u8; 4096];
            // Warmup.
            for _ in 0..1000 {
                node.send(session, &payload, 0, TIMEOUT).unwrap();
                node.recv(session, &mut buf, TIMEOUT).unwrap();
            }
            b.iter(|| {
                node.send(session, black_box(&payload), 0, TIMEOUT).unwrap();
                black_box(node.recv(session, &mut buf, TIMEOUT).unwrap());
            });

            stop.store(true, Ordering::Relaxed);
            echo.join().unwrap();
        });
    }

    group.finish();
}

fn bench_scalar_pingpong(c: &mut Criterion) {
    let mut group = c.benchmark_group("scalar_pingpong");
    group.throughput(Throughput::Elements(1));

    group.bench_function("w32", |b| {
        let fabric = Fabric::new();
        let stop = Arc::new(AtomicBool::new(false));

        let echo_fabric = fabric.clone();
        let echo_stop = stop.clone();
        let echo = thread::spawn(move || {
            pin_to_core(1);
            let node = Node::initialize(&echo_fabric, 0, 1, NodeConfig::default()).unwrap();
            let local = node.endpoint_create(5).unwrap();
            let session = node.session_create(local, ChannelKind::Scalar).unwrap();
            let master = node.endpoint_get(0, 0, 101, TIMEOUT).unwrap();
            node.session_connect(session, master, 0, ChannelKind::Scalar, TIMEOUT)
                .unwrap();
            while !echo_stop.load(Ordering::Relaxed) {
                match node.scalar_recv(session, Some(Duration::from_millis(50))) {
                    Ok(msg) => {
                        node.scalar_send(session, msg.word0, msg.word1, 4, TIMEOUT)
                            .unwrap();
                    }
                    Err(_) => continue,
                }
            }
        });

        let node = Node::initialize(&fabric, 0, 0, NodeConfig::default()).unwrap();
        let local = node.endpoint_create(101).unwrap();
        let session = node.session_create(local, ChannelKind::Scalar).unwrap();
        let remote = node.endpoint_get(0, 1, 5, TIMEOUT).unwrap();
        node.session_connect(session, remote, 1, ChannelKind::Scalar, TIMEOUT)
            .unwrap();

        pin_to_core(0);
        for _ in 0..1000 {
            node.scalar_send(session, 1, 0, 4, TIMEOUT).unwrap();
            node.scalar_recv(session, TIMEOUT).unwrap();
        }
        b.iter(|| {
            node.scalar_send(session, black_box(42), 0, 4, TIMEOUT).unwrap();
            black_box(node.scalar_recv(session, TIMEOUT).unwrap());
        });

        stop.store(true, Ordering::Relaxed);
        echo.join().unwrap();
    });

    group.finish();
}

criterion_group!(benches, bench_packet_pingpong, bench_scalar_pingpong);
criterion_main!(benches);
