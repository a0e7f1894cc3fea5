//! Request round-trip benchmark suite.
//!
//! Benchmarks the request path over the in-memory transport:
//! - Sequential round trips
//! - Concurrent round trips at different fan-outs: 10, 50, 100
//!
//! Run with: cargo bench --bench request_roundtrip
//! Results saved to: target/criterion/

use command_link::transport::memory::{self, MemoryPeer};
use command_link::{
    CommandKind, Connection, ConnectionOptions, HeartbeatOptions, Operation, SessionHandshake,
};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use futures_util::future::join_all;
use serde_json::json;
use tokio::runtime::Runtime;

// ============================================================================
// Benchmark Parameters
// ============================================================================

const FAN_OUTS: &[usize] = &[10, 50, 100];

// ============================================================================
// Setup
// ============================================================================

/// Opens a connection whose backend answers every request.
async fn open_connection() -> Connection {
    let (connector, mut acceptor) = memory::channel();
    let connection = Connection::builder()
        .endpoint("ws://bench.local/")
        .options(ConnectionOptions::new().with_heartbeat(HeartbeatOptions::disabled()))
        .connector(connector)
        .handshake(SessionHandshake::new("bench", "bench"))
        .build()
        .expect("build connection");

    tokio::spawn(async move {
        while let Some(peer) = acceptor.accept().await {
            tokio::spawn(answer_all(peer));
        }
    });

    connection.connect().await.expect("connect");
    connection
}

async fn answer_all(mut peer: MemoryPeer) {
    while let Some(request) = peer.recv_command().await {
        let op = match request.kind {
            CommandKind::Session => Operation::Opened,
            _ => Operation::QueryResult,
        };
        peer.reply(&request, op, json!({"ok": true}));
    }
}

// ============================================================================
// Benchmark: Sequential
// ============================================================================

fn bench_sequential(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let connection = rt.block_on(open_connection());

    c.bench_function("request/sequential", |b| {
        b.to_async(&rt).iter(|| async {
            connection
                .send_request(CommandKind::Conv, Operation::Query, json!({"limit": 1}))
                .await
                .expect("request")
        });
    });
}

// ============================================================================
// Benchmark: Concurrent
// ============================================================================

fn bench_concurrent(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let connection = rt.block_on(open_connection());

    let mut group = c.benchmark_group("request/concurrent");
    for &fan_out in FAN_OUTS {
        group.bench_with_input(BenchmarkId::from_parameter(fan_out), &fan_out, |b, &n| {
            b.to_async(&rt).iter(|| async {
                let requests = (0..n).map(|i| {
                    connection.send_request(CommandKind::Conv, Operation::Query, json!({"i": i}))
                });
                for result in join_all(requests).await {
                    result.expect("request");
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_sequential, bench_concurrent);
criterion_main!(benches);
