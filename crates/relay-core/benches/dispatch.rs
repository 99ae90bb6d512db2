//! Callback dispatch benchmarks for relay-core.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use relay_protocol::{
    BroadcastEvent, ChannelEvent, PostgresChangeFilter, PostgresEvent, PostgresJoinConfig,
    WireMessage,
};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tenvis_relay_core::{CallbackRegistry, Channel, ChannelConfig};

/// Benchmark broadcast dispatch with a growing number of callbacks.
fn bench_broadcast_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast_dispatch");

    for callbacks in [1usize, 10, 100] {
        let registry = CallbackRegistry::new();
        let hits = Arc::new(AtomicU64::new(0));
        for i in 0..callbacks {
            let hits = hits.clone();
            let event = if i % 2 == 0 { "msg" } else { "other" };
            registry.add_broadcast_callback(event, move |_| {
                hits.fetch_add(1, Ordering::Relaxed);
            });
        }
        let event = BroadcastEvent {
            event: "msg".into(),
            payload: json!({"text": "hello"}),
        };

        group.bench_with_input(BenchmarkId::from_parameter(callbacks), &event, |b, event| {
            b.iter(|| registry.trigger_broadcast(black_box(event)))
        });
    }

    group.finish();
}

/// Benchmark a postgres change from wire message to callback.
fn bench_postgres_dispatch(c: &mut Criterion) {
    let channel = Channel::new("realtime:todos", ChannelConfig::default());
    let filter = PostgresChangeFilter::new(PostgresEvent::All, "public").table("todos");
    channel.registry().add_postgres_callback(filter, |change| {
        black_box(change);
    });
    channel.registry().set_server_changes(vec![PostgresJoinConfig {
        schema: "public".into(),
        table: Some("todos".into()),
        filter: None,
        event: PostgresEvent::All,
        id: 7,
    }]);

    let msg = WireMessage::new(
        "realtime:todos",
        "postgres_changes",
        json!({
            "ids": [7],
            "data": {
                "schema": "public",
                "table": "todos",
                "type": "INSERT",
                "record": {"id": 1, "title": "bench"}
            }
        })
        .as_object()
        .cloned()
        .unwrap_or_default(),
        None,
    );

    c.bench_function("postgres_dispatch", |b| {
        b.iter(|| {
            let event = ChannelEvent::decode(black_box(&msg)).unwrap();
            channel.handle_event(&event, None);
        })
    });
}

criterion_group!(benches, bench_broadcast_dispatch, bench_postgres_dispatch);
criterion_main!(benches);
