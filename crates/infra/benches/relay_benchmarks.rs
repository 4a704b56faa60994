use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use eventrelay_events::{Event, ForwardEventHandler, Handler, InMemoryBus, Message};
use eventrelay_infra::event_store::{EventStore, InMemoryEventStore};
use eventrelay_infra::producer::{EventProducer, ProducerConfig};

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn bench_wire_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire_codec");

    for payload_len in [16usize, 1_024, 16_384].iter() {
        let event = Event::new("example_event", "x".repeat(*payload_len));
        let wire = event.to_wire().unwrap();
        group.throughput(Throughput::Bytes(wire.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", payload_len), &event, |b, event| {
            b.iter(|| black_box(event.to_wire().unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("decode", payload_len), &wire, |b, wire| {
            b.iter(|| black_box(Event::from_wire(wire).unwrap()));
        });
    }

    group.finish();
}

fn bench_store_put(c: &mut Criterion) {
    let rt = runtime();
    let store = InMemoryEventStore::new();

    let mut group = c.benchmark_group("store_put");
    group.throughput(Throughput::Elements(1));
    group.bench_function("in_memory_fresh_id", |b| {
        b.to_async(&rt).iter_batched(
            || Event::new("example_event", "Hello, World!"),
            |event| {
                let store = &store;
                async move { store.put(&event).await.unwrap() }
            },
            BatchSize::SmallInput,
        );
    });
    group.finish();
}

fn bench_produce_and_handle(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("pipeline_step");
    group.throughput(Throughput::Elements(1));

    group.bench_function("produce_once_in_memory", |b| {
        let store = Arc::new(InMemoryEventStore::new());
        let bus = InMemoryBus::new();
        let mut producer = EventProducer::new(store, bus, ProducerConfig::default());
        b.iter(|| rt.block_on(async { black_box(producer.produce_once().await.unwrap()) }));
    });

    let handler = ForwardEventHandler::new();
    let message = Message::for_event(&Event::new("example_event", "Hello, World!")).unwrap();
    group.bench_function("forward_handler", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(handler.handle(&message).await.unwrap()) });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_wire_codec,
    bench_store_put,
    bench_produce_and_handle
);
criterion_main!(benches);
