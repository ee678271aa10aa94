//! Performance benchmarks for the output fan-out path.
//!
//! These benchmarks measure the hot paths between the PTY and the clients:
//! - Queueing one chunk for many registered clients
//! - Replay buffer appends
//! - Control message encoding

use std::sync::Arc;

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use protocol::ServerMessage;
use sharetty::session::{ClientRegistry, Outbound, ReplayBuffer};
use tokio::runtime::Runtime;

/// Benchmark queueing a 4 KiB chunk for N clients.
fn bench_registry_fanout(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let mut group = c.benchmark_group("registry_fanout");
    let chunk = Bytes::from(vec![b'x'; 4096]);

    for clients in [1usize, 8, 64] {
        let registry = Arc::new(ClientRegistry::with_limits(clients, 1024));
        let mut receivers = Vec::new();
        runtime.block_on(async {
            for _ in 0..clients {
                let (_, rx) = registry.register().await.unwrap();
                receivers.push(rx);
            }
        });

        group.throughput(Throughput::Bytes((chunk.len() * clients) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(clients), &clients, |b, _| {
            b.iter(|| {
                runtime.block_on(async {
                    registry
                        .for_each(|handle| {
                            handle.try_send(Outbound::Output(black_box(chunk.clone())));
                        })
                        .await;
                });
                // Keep queues from filling up.
                for rx in receivers.iter_mut() {
                    while rx.try_recv().is_ok() {}
                }
            });
        });
    }

    group.finish();
}

/// Benchmark appending output to the replay buffer.
fn bench_replay_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("replay_buffer");

    for chunk_size in [64usize, 4096] {
        let chunk = vec![b'y'; chunk_size];
        let mut buffer = ReplayBuffer::new(64 * 1024);
        group.throughput(Throughput::Bytes(chunk_size as u64));
        group.bench_with_input(BenchmarkId::new("push", chunk_size), &chunk, |b, chunk| {
            b.iter(|| buffer.push(black_box(chunk)));
        });
    }

    let mut full = ReplayBuffer::new(64 * 1024);
    full.push(&vec![b'z'; 64 * 1024]);
    group.bench_function("snapshot_64KB", |b| {
        b.iter(|| black_box(full.snapshot()));
    });

    group.finish();
}

/// Benchmark encoding control messages.
fn bench_control_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("control_encoding");

    group.bench_function("users", |b| {
        b.iter(|| ServerMessage::Users { count: black_box(12) }.to_json().unwrap());
    });
    group.bench_function("exit", |b| {
        b.iter(|| ServerMessage::Exit { code: black_box(Some(0)) }.to_json().unwrap());
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_registry_fanout,
    bench_replay_buffer,
    bench_control_encoding
);
criterion_main!(benches);
