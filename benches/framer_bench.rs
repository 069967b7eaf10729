#![allow(clippy::unwrap_used)]

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use im_protocol_engine::core::envelope::{self, EnvelopeOptions, KeyRing, Outgoing, Seal};
use im_protocol_engine::core::framer::Framer;
use im_protocol_engine::transport::SessionKeyMaterial;
use std::sync::Arc;
use std::time::Duration;

fn stream_of(frames: usize, payload: usize) -> Vec<u8> {
    let mut stream = Vec::with_capacity(frames * (payload + 4));
    for _ in 0..frames {
        stream.extend_from_slice(&((payload + 4) as u32).to_be_bytes());
        stream.extend(std::iter::repeat(0xA5).take(payload));
    }
    stream
}

fn bench_framer(c: &mut Criterion) {
    let mut group = c.benchmark_group("framer");

    for (payload, chunk) in [(64usize, 4096usize), (1024, 1500), (16 * 1024, 8192)] {
        let stream = stream_of(256, payload);
        group.throughput(Throughput::Bytes(stream.len() as u64));
        group.bench_function(format!("reassemble_{payload}b_frames_{chunk}b_reads"), |b| {
            b.iter(|| {
                let mut framer = Framer::new(1 << 20);
                let mut count = 0usize;
                for piece in stream.chunks(chunk) {
                    framer.offer(piece, |_| count += 1).unwrap();
                }
                assert_eq!(count, 256);
            })
        });
    }

    group.finish();
}

fn bench_envelope(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope");
    let material = Arc::new(
        SessionKeyMaterial::new(vec![1; 32], vec![2; 32], [7; 32], Duration::from_secs(60))
            .unwrap(),
    );
    let keys = KeyRing {
        session: Some(material.clone()),
        bootstrap: None,
    };

    for size in [128usize, 4096, 65536] {
        let outgoing = Outgoing {
            command: "Bench.Echo".into(),
            sequence_id: 1,
            account: "10001".into(),
            session_id: Bytes::from(material.public_key.clone()),
            body: Bytes::from(vec![0x5A; size]),
        };
        let options = EnvelopeOptions::default();
        let frame = envelope::wrap(&outgoing, &Seal::Session(&material.session_key), &options).unwrap();
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_function(format!("wrap_{size}b"), |b| {
            b.iter(|| envelope::wrap(&outgoing, &Seal::Session(&material.session_key), &options).unwrap())
        });
        group.bench_function(format!("unwrap_{size}b"), |b| {
            b.iter(|| envelope::unwrap(&frame, &keys).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_framer, bench_envelope);
criterion_main!(benches);
