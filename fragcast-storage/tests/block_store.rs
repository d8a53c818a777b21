//! Concurrency tests for the block store

use fragcast_storage::{Block, BlockStore, BlockStoreConfig, RetentionPolicy};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn block(number: u64) -> Block {
    Block::new(number, [0u8; 32], Vec::new())
}

#[test]
fn blocked_reader_wakes_on_insert() {
    let store = Arc::new(BlockStore::default());
    let reader = {
        let store = store.clone();
        thread::spawn(move || store.wait_for_block(0, 2, None).unwrap())
    };

    thread::sleep(Duration::from_millis(30));
    for n in 0..3 {
        store.insert_block_and_notify(0, block(n)).unwrap();
    }

    let delivered = reader.join().unwrap().expect("block 2 delivered");
    assert_eq!(delivered.number(), 2);
}

#[test]
fn bounded_wait_times_out() {
    let store = BlockStore::default();
    store.insert_block_and_notify(0, block(0)).unwrap();

    let start = Instant::now();
    let result = store
        .wait_for_block(0, 1, Some(Duration::from_millis(40)))
        .unwrap();
    assert!(result.is_none());
    assert!(start.elapsed() >= Duration::from_millis(40));

    // Already stored blocks return immediately
    assert!(store
        .wait_for_block(0, 0, Some(Duration::ZERO))
        .unwrap()
        .is_some());
}

#[test]
fn many_waiters_all_wake() {
    let store = Arc::new(BlockStore::new(BlockStoreConfig::new(1)));
    let waiters: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            thread::spawn(move || store.wait_for_block(0, 0, Some(Duration::from_secs(5))))
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    store.insert_block_and_notify(0, block(0)).unwrap();

    for waiter in waiters {
        assert!(waiter.join().unwrap().unwrap().is_some());
    }
}

#[test]
fn subscriber_sees_every_region_in_insertion_order() {
    let store = Arc::new(BlockStore::new(
        BlockStoreConfig::new(3).with_retention(RetentionPolicy::Lru { capacity: 4 }),
    ));
    let id = store.new_subscriber();

    let producers: Vec<_> = (0..3usize)
        .map(|region| {
            let store = store.clone();
            thread::spawn(move || {
                for n in 0..50 {
                    store.insert_block_and_notify(region, block(n)).unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let mut next = [0u64; 3];
    for _ in 0..150 {
        let (region, block) = store
            .subscriber_wait_for_block(id, Some(Duration::from_secs(1)))
            .expect("delivery");
        assert_eq!(block.number(), next[region]);
        next[region] += 1;
    }
    assert_eq!(next, [50, 50, 50]);
    assert!(store.subscriber_wait_for_block(id, Some(Duration::ZERO)).is_none());
}

#[test]
fn subscriber_blocks_until_insert() {
    let store = Arc::new(BlockStore::default());
    let id = store.new_subscriber();
    let consumer = {
        let store = store.clone();
        thread::spawn(move || store.subscriber_wait_for_block(id, None))
    };

    thread::sleep(Duration::from_millis(20));
    store.insert_block_and_notify(0, block(0)).unwrap();

    let (region, block) = consumer.join().unwrap().unwrap();
    assert_eq!((region, block.number()), (0, 0));
}

#[test]
fn persisted_waiter_wakes() {
    let store = Arc::new(BlockStore::default());
    for n in 0..5 {
        store.insert_block_and_notify(0, block(n)).unwrap();
    }
    let waiter = {
        let store = store.clone();
        thread::spawn(move || store.wait_for_persisted(0, 4, Some(Duration::from_secs(5))))
    };

    thread::sleep(Duration::from_millis(20));
    store.mark_persisted(0, 4).unwrap();
    assert!(waiter.join().unwrap().unwrap());
}

#[test]
fn insert_wakes_only_waiters_at_or_below_the_new_max() {
    let store = Arc::new(BlockStore::new(BlockStoreConfig::new(1)));
    store.insert_block_and_notify(0, block(0)).unwrap();

    let waiter = |target: u64| {
        let store = store.clone();
        thread::spawn(move || store.wait_for_block(0, target, Some(Duration::from_secs(5))))
    };
    let on_one = waiter(1);
    let on_two = waiter(2);

    thread::sleep(Duration::from_millis(20));
    store.insert_block_and_notify(0, block(1)).unwrap();

    let delivered = on_one.join().unwrap().unwrap().expect("block 1 delivered");
    assert_eq!(delivered.number(), 1);
    thread::sleep(Duration::from_millis(50));
    assert!(!on_two.is_finished());

    store.insert_block_and_notify(0, block(2)).unwrap();
    let delivered = on_two.join().unwrap().unwrap().expect("block 2 delivered");
    assert_eq!(delivered.number(), 2);
}
