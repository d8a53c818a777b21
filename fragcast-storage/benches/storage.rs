//! Benchmarks for the block store
//!
//! Run with: cargo bench --package fragcast-storage --bench storage

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fragcast_storage::{Block, BlockStore, BlockStoreConfig, RetentionPolicy};
use std::time::Duration;

fn block(number: u64) -> Block {
    Block::new(number, [0u8; 32], Vec::new())
}

/// Benchmark sequential inserts under each retention policy
fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_insert");
    group.throughput(Throughput::Elements(1_000));

    for (label, retention) in [
        ("window", RetentionPolicy::SlidingWindow { max_size: 64 }),
        ("lru", RetentionPolicy::Lru { capacity: 64 }),
    ] {
        group.bench_function(BenchmarkId::new(label, 1_000), |b| {
            b.iter(|| {
                let store = BlockStore::new(BlockStoreConfig::new(1).with_retention(retention));
                for n in 0..1_000 {
                    store.insert_block_and_notify(0, block(n)).unwrap();
                }
                black_box(store)
            })
        });
    }

    group.finish();
}

/// Benchmark insert with subscriber fan-out
fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_fanout");

    for subscribers in [1usize, 8, 32] {
        group.bench_with_input(
            BenchmarkId::from_parameter(subscribers),
            &subscribers,
            |b, &subscribers| {
                b.iter(|| {
                    let store = BlockStore::default();
                    let ids: Vec<_> = (0..subscribers).map(|_| store.new_subscriber()).collect();
                    for n in 0..100 {
                        store.insert_block_and_notify(0, block(n)).unwrap();
                    }
                    for id in ids {
                        while store
                            .subscriber_wait_for_block(id, Some(Duration::ZERO))
                            .is_some()
                        {}
                    }
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_insert, bench_fanout);
criterion_main!(benches);
