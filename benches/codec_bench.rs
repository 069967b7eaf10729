#![allow(clippy::unwrap_used)]

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use im_protocol_engine::core::tars::{self, Shape, Struct, StructShape, Value};

fn sample(fields: u8) -> Struct {
    let mut value = Struct::new();
    for tag in 0..fields {
        let field = match tag % 4 {
            0 => Value::Long(i64::from(tag) * 1_000_003),
            1 => Value::String(format!("field-{tag}")),
            2 => Value::Bytes(Bytes::from(vec![tag; 64])),
            _ => Value::Struct(Struct::new().with(0, i32::from(tag)).with(1, "nested")),
        };
        value.insert(tag, field);
    }
    value
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("tars");

    for fields in [4u8, 32, 128] {
        let value = sample(fields);
        let encoded = tars::encode(&value);
        let shape = StructShape::of(&value);
        group.throughput(Throughput::Bytes(encoded.len() as u64));

        group.bench_function(format!("encode_{fields}_fields"), |b| {
            b.iter(|| tars::encode(black_box(&value)))
        });
        group.bench_function(format!("decode_{fields}_fields"), |b| {
            b.iter(|| tars::decode(black_box(&encoded), &shape).unwrap())
        });
        group.bench_function(format!("decode_any_{fields}_fields"), |b| {
            b.iter(|| tars::decode_any(black_box(&encoded)).unwrap())
        });

        // Skip past every other field to reach the last one
        let last = fields - 1;
        let last_shape = Shape::of(value.get(last).unwrap());
        group.bench_function(format!("skip_to_tag_{fields}_fields"), |b| {
            b.iter(|| tars::decode_field(black_box(&encoded), last, &last_shape).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_codec);
criterion_main!(benches);
