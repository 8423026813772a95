//! Binary codec and CSV conversion benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use espconnect_protocol::{decode, CsvOptions, Encoder, Schema};
use serde_json::{json, Value};

fn create_events(count: usize) -> Value {
    let entries: Vec<Value> = (0..count)
        .map(|i| {
            json!({
                "@opcode": "insert",
                "id": i as i64,
                "big": 5_000_000_000i64 + i as i64,
                "symbol": format!("SYM{}", i % 50),
                "price": "101.25",
            })
        })
        .collect();
    json!({"events": {"@id": "bench-1", "entries": entries}})
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec_encode");

    for count in [10, 100, 1000] {
        let events = create_events(count);

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &events, |b, events| {
            b.iter(|| black_box(Encoder::encode_json(events)));
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec_decode");

    for count in [10, 100, 1000] {
        let encoded = Encoder::encode_json(&create_events(count));

        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &encoded, |b, encoded| {
            b.iter(|| black_box(decode(encoded).unwrap()));
        });
    }

    group.finish();
}

fn bench_json_baseline(c: &mut Criterion) {
    let mut group = c.benchmark_group("json_encode");

    for count in [10, 100, 1000] {
        let events = create_events(count);

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &events, |b, events| {
            b.iter(|| black_box(serde_json::to_vec(events).unwrap()));
        });
    }

    group.finish();
}

fn bench_csv_rows(c: &mut Criterion) {
    let mut group = c.benchmark_group("csv_rows");
    let schema = Schema::from_json(&json!({"fields": [
        {"@name": "id", "@type": "int64", "@key": "true"},
        {"@name": "symbol", "@type": "utf8str"},
        {"@name": "price", "@type": "double"}
    ]}));
    let options = CsvOptions {
        opcodes: true,
        ..CsvOptions::default()
    };

    for count in [100, 1000, 10000] {
        let csv: String = (0..count)
            .map(|i| format!("i,{},\"SYM,{}\",{}.5\n", i, i % 50, i))
            .collect();

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &csv, |b, csv| {
            b.iter(|| black_box(schema.rows_from_csv(csv, &options)));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_encode,
    bench_decode,
    bench_json_baseline,
    bench_csv_rows,
);

criterion_main!(benches);
