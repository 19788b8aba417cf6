//! Echo round-trip benchmarks per backend
//!
//! One server thread running the inline event loop, one blocking client.
//! Measures: how many request/echo pairs complete per second for each
//! backend and message size?

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use weft::prelude::*;

const MESSAGE_SIZES: &[usize] = &[64, 1024, 16384];
const MESSAGE_COUNT: usize = 1_000;

struct EchoServer {
    addr: std::net::SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EchoServer {
    fn start(backend: BackendKind) -> Self {
        let (addr_tx, addr_rx) = flume::bounded(1);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = thread::spawn(move || {
            let config = ServerConfig::default().with_backend(backend);
            let mut server = Server::bind(Endpoint::localhost(0), config).unwrap();
            server.on_connection(|connection| {
                connection.observe(
                    |connection, message| {
                        let _ = connection.send(message.payload());
                    },
                    |_| {},
                );
            });
            addr_tx.send(server.local_addr()).unwrap();
            while !stop_flag.load(Ordering::Relaxed) {
                server.poll_once().unwrap();
            }
            server.disconnect_all().unwrap();
        });

        Self {
            addr: addr_rx.recv().unwrap(),
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn backends() -> Vec<BackendKind> {
    BackendKind::available()
        .iter()
        .copied()
        .filter(|&kind| {
            #[cfg(target_os = "linux")]
            if kind == BackendKind::Completion {
                return weft::completion::is_supported();
            }
            let _ = kind;
            true
        })
        .collect()
}

fn echo_round_trip(c: &mut Criterion) {
    weft::dev_tracing::init_tracing();

    for backend in backends() {
        let mut group = c.benchmark_group(format!("echo/{backend}"));
        group.measurement_time(Duration::from_secs(10));
        group.sample_size(10);
        let server = EchoServer::start(backend);

        for &size in MESSAGE_SIZES {
            group.throughput(Throughput::Bytes((size * MESSAGE_COUNT) as u64));
            group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
                let payload = vec![b'e'; size];
                let mut client = Client::connect(server.addr).unwrap();
                b.iter(|| {
                    for _ in 0..MESSAGE_COUNT {
                        client.send(&payload).unwrap();
                        let reply = client.recv().unwrap().unwrap();
                        assert_eq!(reply.len(), size);
                    }
                });
            });
        }
        group.finish();
    }
}

criterion_group!(benches, echo_round_trip);
criterion_main!(benches);
