//! Benchmarks for the pooled transfer path over the in-memory transport
//!
//! Run with: cargo bench

use std::hint::black_box;
use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};
use pooled_sftp::config::ClientConfig;
use pooled_sftp::ssh::{MemoryTransport, SftpClient, normalize_remote};

fn create_client(rt: &tokio::runtime::Runtime, transport: &MemoryTransport) -> SftpClient {
    let config = ClientConfig::with_password("bench.example", "bench", "bench");
    rt.block_on(SftpClient::with_transport(config, Arc::new(transport.clone())))
        .expect("memory transport always connects")
}

fn benchmark_single_file(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");
    let transport = MemoryTransport::new();
    let client = create_client(&rt, &transport);

    let dir = tempfile::tempdir().expect("tempdir");
    let src = dir.path().join("one_mib.bin");
    std::fs::write(&src, vec![0x5a_u8; 1024 * 1024]).expect("write bench file");
    let dst = dir.path().join("one_mib.out");

    c.bench_function("put 1 MiB", |b| {
        b.iter(|| rt.block_on(client.put(black_box(&src), "/one_mib.bin", None)));
    });

    c.bench_function("get 1 MiB", |b| {
        b.iter(|| rt.block_on(client.get(black_box("/one_mib.bin"), &dst, None)));
    });

    c.bench_function("stat (pooled session reuse)", |b| {
        b.iter(|| rt.block_on(client.stat(black_box("/one_mib.bin"))));
    });

    rt.block_on(client.shutdown());
}

fn benchmark_concurrent_stats(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");
    let transport = MemoryTransport::new();
    transport.add_file("/f", b"x");
    let client = create_client(&rt, &transport);

    c.bench_function("64 concurrent stats, 4 sessions", |b| {
        b.iter(|| {
            rt.block_on(async {
                let handles: Vec<_> = (0..64)
                    .map(|_| {
                        let client = client.clone();
                        tokio::spawn(async move { client.stat("/f").await })
                    })
                    .collect();
                for handle in handles {
                    let _ = handle.await;
                }
            });
        });
    });

    rt.block_on(client.shutdown());
}

fn benchmark_put_dir(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");
    let transport = MemoryTransport::new();
    let client = create_client(&rt, &transport);

    let dir = tempfile::tempdir().expect("tempdir");
    for d in 0..4 {
        let sub = dir.path().join(format!("dir{d}"));
        std::fs::create_dir_all(&sub).expect("create bench dir");
        for f in 0..16 {
            std::fs::write(sub.join(format!("file{f}.txt")), vec![b'a'; 4096]).expect("write");
        }
    }

    c.bench_function("put_dir 4x16 files", |b| {
        b.iter(|| rt.block_on(client.put_dir(black_box(dir.path()), "/tree", None)));
    });

    rt.block_on(client.shutdown());
}

fn benchmark_normalize(c: &mut Criterion) {
    c.bench_function("normalize_remote (messy path)", |b| {
        b.iter(|| normalize_remote(black_box("\\srv//data\\\\exports/2024//q3/")));
    });
}

criterion_group!(
    benches,
    benchmark_single_file,
    benchmark_concurrent_stats,
    benchmark_put_dir,
    benchmark_normalize
);
criterion_main!(benches);
