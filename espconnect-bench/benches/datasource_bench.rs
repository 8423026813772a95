//! Event delivery into datasource caches.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use espconnect_client::engine::EngineConfig;
use espconnect_client::{
    Datasource, DatasourceOptions, EventCollection, EventStream, ProtocolEngine,
};
use espconnect_protocol::Schema;
use serde_json::{json, Value};

fn schema() -> Schema {
    Schema::from_json(&json!({"fields": [
        {"@name": "id", "@type": "int64", "@key": "true"},
        {"@name": "price", "@type": "double"}
    ]}))
}

fn batch(count: usize, offset: usize) -> Value {
    let entries: Vec<Value> = (0..count)
        .map(|i| json!({"id": ((i + offset) % 500) as i64, "price": 1.5}))
        .collect();
    json!({"entries": entries})
}

fn bench_event_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_stream_deliver");
    let engine = ProtocolEngine::new(EngineConfig::default(), None);

    for count in [10, 100, 1000] {
        let stream = EventStream::new(&engine, DatasourceOptions::new("p/cq/w").with_maxevents(200));
        stream.core().install_schema(stream.as_dyn(), schema());
        let body = batch(count, 0);

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &body, |b, body| {
            b.iter(|| {
                stream.core().handle_events(stream.as_dyn(), body);
                black_box(stream.len())
            });
        });
    }

    group.finish();
}

fn bench_event_collection(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_collection_upsert");
    let engine = ProtocolEngine::new(EngineConfig::default(), None);

    for count in [10, 100, 1000] {
        let collection = EventCollection::new(&engine, DatasourceOptions::new("p/cq/w"));
        collection.core().install_schema(collection.as_dyn(), schema());
        let body = batch(count, 7);

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &body, |b, body| {
            b.iter(|| {
                collection.core().handle_events(collection.as_dyn(), body);
                black_box(collection.len())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_event_stream, bench_event_collection);

criterion_main!(benches);
