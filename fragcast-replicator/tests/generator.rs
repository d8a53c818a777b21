use bytes::Bytes;
use fragcast_core::config::FragmentConfig;
use fragcast_core::erasure::CodecBackend;
use fragcast_replicator::{FragmentGenerator, ReplicatorError};
use rayon::ThreadPoolBuilder;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn generator(configs: &[FragmentConfig]) -> FragmentGenerator {
    let workers = Arc::new(ThreadPoolBuilder::new().num_threads(2).build().unwrap());
    FragmentGenerator::new(configs, workers).unwrap()
}

#[test]
fn shared_shard_counts_share_one_pool() {
    let small = FragmentConfig::new(4, 2, 1).with_concurrency(2);
    let wide = FragmentConfig::new(4, 2, 3);
    let other = FragmentConfig::new(6, 3, 2);
    let gen = generator(&[small, wide, other]);

    assert_eq!(gen.available(&small), Some(5));
    assert_eq!(gen.available(&wide), Some(5));
    assert_eq!(gen.available(&other), Some(2));
    assert_eq!(gen.available(&FragmentConfig::new(5, 5, 1)), None);
}

#[test]
fn unknown_config_is_an_error() {
    let gen = generator(&[FragmentConfig::new(4, 2, 1)]);
    assert!(matches!(
        gen.get_empty_context(&FragmentConfig::new(4, 3, 1)),
        Err(ReplicatorError::UnprovisionedConfig {
            data_shards: 4,
            parity_shards: 3
        })
    ));
}

#[test]
fn oversized_request_fails_fast() {
    let gen = generator(&[FragmentConfig::new(4, 2, 2)]);
    assert!(matches!(
        gen.get_empty_context(&FragmentConfig::new(4, 2, 3)),
        Err(ReplicatorError::PoolTooSmall {
            requested: 3,
            capacity: 2
        })
    ));
}

#[test]
fn contexts_return_codecs_on_drop() {
    let config = FragmentConfig::new(3, 2, 2).with_concurrency(2);
    let gen = generator(&[config]);

    let first = gen.get_empty_context(&config).unwrap();
    let second = gen.get_empty_context(&config).unwrap();
    assert_eq!(gen.available(&config), Some(0));

    let started = Instant::now();
    assert!(matches!(
        gen.get_empty_context_timeout(&config, Duration::from_millis(50)),
        Err(ReplicatorError::Timeout)
    ));
    assert!(started.elapsed() >= Duration::from_millis(50));

    drop(first);
    assert_eq!(gen.available(&config), Some(2));
    gen.free_context(second);
    assert_eq!(gen.available(&config), Some(4));
}

#[test]
fn exhausted_pool_blocks_until_freed() {
    let config = FragmentConfig::new(3, 2, 2);
    let gen = Arc::new(generator(&[config]));
    let held = gen.get_empty_context(&config).unwrap();

    let waiter = {
        let gen = gen.clone();
        thread::spawn(move || gen.get_empty_context(&config).map(|ctx| ctx.instance_count()))
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!waiter.is_finished());

    drop(held);
    assert_eq!(waiter.join().unwrap().unwrap(), 2);
    assert_eq!(gen.available(&config), Some(2));
}

#[test]
fn pooled_contexts_round_trip() {
    let config = FragmentConfig::new(4, 4, 2)
        .with_concurrency(2)
        .with_backend(CodecBackend::Galois8);
    let gen = generator(&[config]);
    assert_eq!(gen.backend(&config), Some(CodecBackend::Galois8));

    let message: Vec<u8> = (0..50_000u32).map(|i| (i % 239) as u8).collect();
    let mut sender = gen.get_empty_context(&config).unwrap();
    sender.init_with_message(&message).unwrap();
    let mut raw = Vec::new();
    sender.serialize_fragments(4, 8, &mut raw, 0).unwrap();

    let receiver = gen.get_empty_context(&config).unwrap();
    receiver
        .validate_and_deserialize_fragments(&sender.root().unwrap(), Bytes::from(raw), 4, 8)
        .unwrap();
    let mut out = Vec::new();
    receiver.regenerate_message(message.len(), &mut out).unwrap();
    assert_eq!(out, message);
}

#[test]
fn conflicting_backends_keep_the_first() {
    let simd = FragmentConfig::new(4, 2, 1);
    let galois = simd.with_backend(CodecBackend::Galois8);
    let gen = generator(&[simd, galois]);
    assert_eq!(gen.backend(&galois), Some(CodecBackend::Simd));
    assert_eq!(gen.available(&simd), Some(2));
}

#[test]
fn invalid_configs_are_rejected() {
    let workers = Arc::new(ThreadPoolBuilder::new().num_threads(1).build().unwrap());
    assert!(FragmentGenerator::new(&[FragmentConfig::new(0, 2, 1)], workers).is_err());
}
