//! Criterion benchmarks for hot paths in the dispatch loop.
//!
//! Run with:
//!   cargo bench
//!
//! Covers:
//!   - priority index enqueue/dequeue (BinaryHeap)
//!   - token-bucket rate limiter acquire
//!   - circuit breaker admission check

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use reqflow::index::{IndexStore, InMemoryIndexStore};
use reqflow::rate_limiter::{RateLimiter, RateLimiterConfig};
use tokio::runtime::Runtime;

fn bench_priority_index(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("priority_index_enqueue_dequeue_1000", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryIndexStore::new();
                for i in 0..1000u8 {
                    store.enqueue_priority(&format!("req-{i}"), i % 100).await;
                }
                while let Some(id) = store.dequeue_priority().await {
                    black_box(id);
                }
            });
        });
    });
}

fn bench_rate_limiter(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let limiter = RateLimiter::new(RateLimiterConfig {
        capacity: 1_000_000.0,
        refill_per_sec: 1_000_000.0,
    });

    c.bench_function("rate_limiter_try_acquire", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(limiter.try_acquire("api.example.com").await);
            });
        });
    });
}

criterion_group!(benches, bench_priority_index, bench_rate_limiter);
criterion_main!(benches);
