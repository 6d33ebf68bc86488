use criterion::{Criterion, criterion_group, criterion_main};
use std::sync::Arc;

use core_events::{DoerKind, Event, EventKind, Tag};
use core_fabric::{TaskFabric, TaskToken};

fn bench_task_roundtrip(c: &mut Criterion) {
    let fabric = Arc::new(TaskFabric::new(4096));
    let mut token = TaskToken::new(fabric.clone());

    c.bench_function("task_enqueue_dequeue", |b| {
        b.iter(|| {
            for inner in 0..64u32 {
                token.enqueue(Event::single(
                    EventKind::Fft,
                    Tag::for_antenna(0, 0, inner),
                ));
            }
            token.flush();
            let mut n = 0;
            while let Some(ev) = fabric.pop_task(0, DoerKind::Fft) {
                n += ev.tags.len();
            }
            assert_eq!(n, 64);
        });
    });
}

fn bench_batched_events(c: &mut Criterion) {
    let fabric = Arc::new(TaskFabric::new(4096));
    let mut token = TaskToken::new(fabric.clone());

    c.bench_function("task_enqueue_batched16", |b| {
        b.iter(|| {
            for block in 0..4u32 {
                let tags = (0..16).map(|i| Tag::for_antenna(0, 0, block * 16 + i));
                token.enqueue(Event::batched(EventKind::Fft, tags));
            }
            token.flush();
            while fabric.pop_task(0, DoerKind::Fft).is_some() {}
        });
    });
}

criterion_group!(benches, bench_task_roundtrip, bench_batched_events);
criterion_main!(benches);
