#![allow(clippy::unwrap_used, clippy::uninlined_format_args)]

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use im_protocol_engine::utils::compression::{compress, compress_body, decompress, CompressionKind};

fn bench_compression(c: &mut Criterion) {
    let mut group = c.benchmark_group("compression");
    let sizes = [512usize, 4096, 65536, 1024 * 1024];

    for &size in &sizes {
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        group.throughput(Throughput::Bytes(size as u64));

        for kind in [CompressionKind::Lz4, CompressionKind::Zstd] {
            let name = format!("{kind:?}").to_lowercase();
            group.bench_function(format!("{}_compress_{}b", name, size), |b| {
                b.iter_batched(
                    || data.clone(),
                    |d| {
                        let _ = compress(&d, kind).unwrap();
                    },
                    BatchSize::SmallInput,
                )
            });
            group.bench_function(format!("{}_decompress_{}b", name, size), |b| {
                let compressed = compress(&data, kind).unwrap();
                b.iter(|| {
                    let out = decompress(&compressed, kind, size).unwrap();
                    assert_eq!(out.len(), data.len());
                })
            });
        }

        // Threshold and entropy check on the send path
        group.bench_function(format!("body_decision_{}b", size), |b| {
            b.iter(|| compress_body(&data, Some(CompressionKind::Lz4), 512).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_compression);
criterion_main!(benches);
