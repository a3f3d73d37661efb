//! Batch throughput benchmark
//!
//! Measures end-to-end cost of a batch call for trivially cheap work:
//! admission, fan-out, semaphore handoff and ordered collection.
//! Compares plain dispatch against priority dispatch.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use everruns_batch::{BatchConfig, BatchProcessor, ItemContext, PrioritizedItem};

fn processor(max_concurrency: usize) -> Arc<BatchProcessor> {
    Arc::new(
        BatchProcessor::new(
            BatchConfig::new()
                .with_name("bench")
                .with_max_concurrency(max_concurrency),
        )
        .unwrap(),
    )
}

async fn square(_ctx: ItemContext, v: u64) -> anyhow::Result<u64> {
    tokio::task::yield_now().await;
    Ok(v * v)
}

/// Benchmark plain dispatch across batch sizes
fn bench_plain(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let processor = processor(16);

    let mut group = c.benchmark_group("batch/plain");
    for batch_size in [10u64, 100, 1_000] {
        group.throughput(Throughput::Elements(batch_size));
        group.bench_with_input(
            BenchmarkId::new("items", batch_size),
            &batch_size,
            |b, &batch_size| {
                b.to_async(&rt).iter(|| {
                    let processor = Arc::clone(&processor);
                    async move {
                        let items: Vec<u64> = (0..batch_size).collect();
                        let result = processor
                            .process(&CancellationToken::new(), items, square)
                            .await
                            .unwrap();
                        assert_eq!(result.success_count as u64, batch_size);
                    }
                });
            },
        );
    }

    group.finish();
}

/// Benchmark priority dispatch across batch sizes
fn bench_priority(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let processor = processor(16);

    let mut group = c.benchmark_group("batch/priority");
    for batch_size in [10u64, 100, 1_000] {
        group.throughput(Throughput::Elements(batch_size));
        group.bench_with_input(
            BenchmarkId::new("items", batch_size),
            &batch_size,
            |b, &batch_size| {
                b.to_async(&rt).iter(|| {
                    let processor = Arc::clone(&processor);
                    async move {
                        let items: Vec<PrioritizedItem<u64>> = (0..batch_size)
                            .map(|v| PrioritizedItem::new(v, (v % 7) as i64))
                            .collect();
                        let result = processor
                            .process_with_priority(&CancellationToken::new(), items, square)
                            .await
                            .unwrap();
                        assert_eq!(result.success_count as u64, batch_size);
                    }
                });
            },
        );
    }

    group.finish();
}

/// Benchmark how throughput scales with the concurrency limit
fn bench_concurrency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("batch/concurrency");
    group.sample_size(20);
    let batch_size = 500u64;
    group.throughput(Throughput::Elements(batch_size));

    for max_concurrency in [1usize, 4, 16, 64] {
        let processor = processor(max_concurrency);
        group.bench_with_input(
            BenchmarkId::new("permits", max_concurrency),
            &max_concurrency,
            |b, _| {
                b.to_async(&rt).iter(|| {
                    let processor = Arc::clone(&processor);
                    async move {
                        let items: Vec<u64> = (0..batch_size).collect();
                        processor
                            .process(&CancellationToken::new(), items, square)
                            .await
                            .unwrap()
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_plain, bench_priority, bench_concurrency);

criterion_main!(benches);
