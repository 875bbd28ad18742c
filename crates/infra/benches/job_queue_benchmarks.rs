use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use queuectl_core::{JobSpec, RetryPolicy, WorkerId};
use queuectl_infra::jobs::{InMemoryJobStore, JobStore, SqliteJobStore, StoreSettings};
use std::time::Duration;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Enqueue `n` jobs, then claim and complete each one.
async fn drain<S: JobStore>(store: &S, n: usize) {
    let worker = WorkerId::from_raw("bench");
    for i in 0..n {
        store.enqueue(JobSpec::new(format!("echo {i}"))).await.unwrap();
    }
    while let Some(job) = store.claim(&worker).await.unwrap() {
        let token = job.claim_token.unwrap();
        black_box(store.complete(&job.id, &token).await.unwrap());
    }
}

fn bench_claim_complete_cycle(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim_complete_cycle");

    for n in [10usize, 100] {
        group.throughput(Throughput::Elements(n as u64));

        group.bench_with_input(BenchmarkId::new("in_memory", n), &n, |b, &n| {
            b.iter(|| {
                let store = InMemoryJobStore::new(StoreSettings::default());
                rt.block_on(drain(&store, n));
            });
        });

        group.bench_with_input(BenchmarkId::new("sqlite", n), &n, |b, &n| {
            let dir = tempfile::tempdir().unwrap();
            let store = rt
                .block_on(SqliteJobStore::open(
                    &dir.path().join("bench.db"),
                    StoreSettings::default(),
                ))
                .unwrap();
            b.iter(|| rt.block_on(drain(&store, n)));
        });
    }

    group.finish();
}

fn bench_backoff(c: &mut Criterion) {
    let policy = RetryPolicy::exponential(Duration::from_secs(1), Duration::from_secs(300), 0.1);

    c.bench_function("backoff_with_jitter", |b| {
        b.iter(|| {
            for attempts in 0..32u32 {
                black_box(policy.backoff_with_jitter(black_box(attempts), 0.5));
            }
        });
    });
}

criterion_group!(benches, bench_claim_complete_cycle, bench_backoff);
criterion_main!(benches);
