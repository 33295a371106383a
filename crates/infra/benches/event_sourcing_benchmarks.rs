use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;

use eventline_events::{Change, Command, DomainModel, Event, Handlers, Transitions};
use eventline_infra::command_service::CommandService;
use eventline_infra::event_store::{EventStore, InMemoryEventStore, Transport};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
}

fn counter() -> DomainModel<u64> {
    DomainModel::init(
        "Counter",
        0,
        Transitions::new().on("incremented", |n: &mut u64, _| *n += 1),
        Handlers::new().on("increment", |m: &mut DomainModel<u64>, c| {
            m.causes([Event::new("incremented", c.aggregate_id(), Vec::new())]);
            Ok(())
        }),
    )
}

fn history(stream: &str, n: usize) -> Vec<Event> {
    (0..n)
        .map(|_| Event::new("incremented", stream, Vec::new()))
        .collect()
}

fn bench_event_append_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("event_append_throughput");

    for batch_size in [1usize, 10, 100, 1000] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, &batch_size| {
                let store = InMemoryEventStore::new();
                let mut stream = 0u64;
                b.iter(|| {
                    stream += 1;
                    let name = format!("s-{stream}");
                    let change = Change::new(name.clone(), 0, history(&name, batch_size));
                    black_box(rt.block_on(store.append(vec![change])).expect("append"));
                });
            },
        );
    }
    group.finish();
}

fn bench_model_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("model_replay");

    for event_count in [10usize, 100, 1000, 10000] {
        let events = history("replay", event_count);
        group.throughput(Throughput::Elements(event_count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(event_count), &events, |b, events| {
            b.iter(|| {
                let mut model = counter();
                model.load(black_box(events));
                black_box(model.version());
            });
        });
    }
    group.finish();
}

fn bench_subscription_fetch(c: &mut Criterion) {
    let rt = runtime();
    let store = InMemoryEventStore::new();
    rt.block_on(store.append(vec![Change::new("s", 0, history("s", 20_000))]))
        .expect("seed");

    let mut group = c.benchmark_group("subscription_fetch");
    for batch_size in [1024usize, 4096, 16384] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, &batch_size| {
                b.iter(|| {
                    let batch = rt
                        .block_on(store.subscribe_with_offset(1000, batch_size).recv())
                        .expect("fetch");
                    black_box(batch.len());
                });
            },
        );
    }
    group.finish();
}

fn bench_command_processing(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("command_processing");
    group.sample_size(1000);

    group.bench_function("fresh_aggregate", |b| {
        let svc = CommandService::new(Arc::new(InMemoryEventStore::new()), counter);
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            let cmd = Command::new("increment", format!("c-{n}"));
            black_box(rt.block_on(svc.process(&cmd)).expect("process"));
        });
    });

    group.bench_function("aggregate_with_history", |b| {
        let store = Arc::new(InMemoryEventStore::new());
        rt.block_on(store.append(vec![Change::new("hot", 0, history("hot", 500))]))
            .expect("seed");
        let svc = CommandService::new(store, counter);
        let mut version = 500u64;
        b.iter(|| {
            let cmd = Command::new("increment", "hot").with_expected_version(version);
            black_box(rt.block_on(svc.process(&cmd)).expect("process"));
            version += 1;
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_event_append_throughput,
    bench_model_replay,
    bench_subscription_fetch,
    bench_command_processing
);
criterion_main!(benches);
