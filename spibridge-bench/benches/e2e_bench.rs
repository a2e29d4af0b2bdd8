//! End-to-end host-to-emulator benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use spibridge_client::{BridgeAddr, Client, ConnectionConfig};
use spibridge_emu::{spawn_duplex, BridgeServer, EmulatedFlash, FlashConfig, ServerConfig};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;

fn client_config(addr: BridgeAddr) -> ConnectionConfig {
    ConnectionConfig::new(addr)
}

fn setup_duplex(rt: &Runtime) -> Client {
    let client = Client::new(client_config(BridgeAddr::Tcp("127.0.0.1:0".to_string())));
    rt.block_on(async {
        client
            .attach(spawn_duplex(EmulatedFlash::new(FlashConfig::default())))
            .await;
    });
    client
}

fn setup_tcp(rt: &Runtime) -> (Arc<BridgeServer>, Client) {
    rt.block_on(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = Arc::new(BridgeServer::new(
            ServerConfig::new(addr),
            EmulatedFlash::new(FlashConfig::default()),
        ));
        let runner = server.clone();
        tokio::spawn(async move {
            let _ = runner.serve(listener).await;
        });

        let client = Client::new(client_config(BridgeAddr::Tcp(addr.to_string())));
        client.connect().await.unwrap();
        (server, client)
    })
}

fn bench_status_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let duplex = setup_duplex(&rt);
    let (_server, tcp) = setup_tcp(&rt);

    let mut group = c.benchmark_group("e2e_read_status");
    group.throughput(Throughput::Elements(1));

    group.bench_function("duplex", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(duplex.read_status().await.unwrap()) });
    });
    group.bench_function("tcp", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(tcp.read_status().await.unwrap()) });
    });

    group.finish();
}

fn bench_read_throughput(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let client = setup_duplex(&rt);

    let mut group = c.benchmark_group("e2e_read_data");

    for size in [256usize, 4096, 64 * 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.to_async(&rt)
                .iter(|| async { black_box(client.read_data(0, size).await.unwrap()) });
        });
    }

    group.finish();
}

fn bench_program_page(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let client = setup_duplex(&rt);
    let page = vec![0x00u8; 256];

    let mut group = c.benchmark_group("e2e_program_page");
    group.throughput(Throughput::Bytes(page.len() as u64));

    group.bench_function("wren_and_program", |b| {
        b.to_async(&rt).iter(|| async {
            client.write_enable().await.unwrap();
            client.page_program(0x1000, &page).await.unwrap();
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_status_latency,
    bench_read_throughput,
    bench_program_page,
);
criterion_main!(benches);
