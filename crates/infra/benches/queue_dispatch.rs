use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use flyerq_core::{StoreId, SystemClock};
use flyerq_infra::config::{LockConfig, QueueConfig};
use flyerq_infra::jobs::{ExtractionJobQueue, InMemoryJobStore, JobType};
use flyerq_infra::locks::{InMemoryLockStore, LockManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

type Queue = ExtractionJobQueue<Arc<InMemoryJobStore>>;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

fn queue_with_backlog(rt: &Runtime, backlog: usize) -> Queue {
    let queue = ExtractionJobQueue::new(InMemoryJobStore::arc(), Arc::new(SystemClock), QueueConfig::default());
    rt.block_on(async {
        for i in 0..backlog {
            queue
                .create_scrape_flyer_job(StoreId::new(), (i % 10) as i32 + 1)
                .await
                .unwrap();
        }
    });
    queue
}

fn bench_job_creation(c: &mut Criterion) {
    let rt = runtime();
    let queue = queue_with_backlog(&rt, 0);

    c.bench_function("create_scrape_flyer_job", |b| {
        b.iter(|| {
            rt.block_on(queue.create_scrape_flyer_job(StoreId::new(), black_box(5)))
                .unwrap();
        });
    });
}

fn bench_dispatch_by_backlog(c: &mut Criterion) {
    let mut group = c.benchmark_group("lease_and_complete");
    let rt = runtime();

    for backlog in [100usize, 1_000, 10_000] {
        let queue = queue_with_backlog(&rt, backlog);
        group.throughput(Throughput::Elements(1));

        // Backlog stays constant: one job in, one job out per iteration
        group.bench_with_input(BenchmarkId::from_parameter(backlog), &backlog, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    queue.create_scrape_flyer_job(StoreId::new(), 5).await.unwrap();
                    let job = queue
                        .get_next_job(&[JobType::ScrapeFlyer], "bench-worker")
                        .await
                        .unwrap()
                        .unwrap();
                    queue.complete_job(black_box(job.id)).await.unwrap();
                });
            });
        });
    }

    group.finish();
}

fn bench_lock_round_trip(c: &mut Criterion) {
    let rt = runtime();
    let locks = LockManager::new(InMemoryLockStore::arc(), LockConfig::default());

    c.bench_function("lock_acquire_release", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut lock = locks
                    .acquire_lock(black_box("store:bench"), Duration::from_secs(30))
                    .await
                    .unwrap();
                lock.release().await.unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_job_creation,
    bench_dispatch_by_backlog,
    bench_lock_round_trip
);
criterion_main!(benches);
