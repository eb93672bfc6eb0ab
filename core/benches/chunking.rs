use std::io::Cursor;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use futures::StreamExt;

use vault_core::chunking::chunk_stream;
use vault_core::testing::{get_fake_data, get_runtime};

struct Parameters {
    min_size: usize,
    avg_size: usize,
    max_size: usize,
}

pub fn bench_chunking(c: &mut Criterion) {
    let rt = get_runtime();
    let data = get_fake_data(128 * 1024 * 1024); // 128 MiB

    let cases = [
        (
            "2K,4K,8K",
            Parameters {
                min_size: 2 * 1024,
                avg_size: 4 * 1024,
                max_size: 8 * 1024,
            },
        ),
        (
            "2M,4M,8M",
            Parameters {
                min_size: 2 * 1024 * 1024,
                avg_size: 4 * 1024 * 1024,
                max_size: 8 * 1024 * 1024,
            },
        ),
    ];

    let mut group = c.benchmark_group("chunking");
    group.throughput(Throughput::Bytes(data.len() as u64));

    for (case, params) in cases {
        group.bench_with_input(BenchmarkId::new("rolling_hash", case), &params, |b, params| {
            b.to_async(&rt).iter(|| async {
                let cursor = Cursor::new(&data);
                let mut chunks = chunk_stream(cursor, params.min_size, params.avg_size, params.max_size);
                while let Some(chunk) = chunks.next().await {
                    black_box(chunk).unwrap();
                }
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_chunking);
criterion_main!(benches);
