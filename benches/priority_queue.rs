//! Benchmarks the O(log B + log K) enqueue/dequeue path and the
//! `process_items` walk-and-remove traversal under contention-free,
//! single-threaded conditions.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use pipqueue_core::pip::{BoxFuture, RunnablePip, SlotReleaser};
use pipqueue_core::priority_queue::{PriorityQueue, ProcessDecision};
use rand::Rng;

struct BenchPip(i32);

impl RunnablePip for BenchPip {
    fn priority(&self) -> i32 {
        self.0
    }
    fn run(self: Box<Self>, _releaser: Box<dyn SlotReleaser>) -> BoxFuture<'static, pipqueue_core::error::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

fn bench_enqueue_dequeue(c: &mut Criterion) {
    let mut rng = rand::thread_rng();
    let priorities: Vec<i32> = (0..10_000).map(|_| rng.gen_range(0..1_000_000_000)).collect();

    c.bench_function("enqueue_10k_random_priorities", |b| {
        b.iter(|| {
            let q = PriorityQueue::new();
            for &p in &priorities {
                q.enqueue(p, Box::new(BenchPip(p))).unwrap();
            }
            black_box(q.len());
        })
    });

    c.bench_function("enqueue_then_drain_10k", |b| {
        b.iter(|| {
            let q = PriorityQueue::new();
            for &p in &priorities {
                q.enqueue(p, Box::new(BenchPip(p))).unwrap();
            }
            while q.dequeue().is_some() {}
        })
    });
}

fn bench_process_items_walk(c: &mut Criterion) {
    let mut rng = rand::thread_rng();
    let priorities: Vec<i32> = (0..10_000).map(|_| rng.gen_range(0..1_000_000_000)).collect();

    c.bench_function("process_items_full_walk_no_removal", |b| {
        let q = PriorityQueue::new();
        for &p in &priorities {
            q.enqueue(p, Box::new(BenchPip(p))).unwrap();
        }
        b.iter(|| {
            let mut count = 0;
            q.process_items(|_priority, _pip| {
                count += 1;
                ProcessDecision::Keep
            })
            .unwrap();
            black_box(count);
        })
    });
}

criterion_group!(benches, bench_enqueue_dequeue, bench_process_items_walk);
criterion_main!(benches);
