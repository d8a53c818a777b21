//! Property tests for the erasure codecs

use fragcast_core::erasure::{new_codec, CodecBackend, ErasureConfig};
use fragcast_core::Error;
use proptest::prelude::*;

fn backend() -> impl Strategy<Value = CodecBackend> {
    prop_oneof![Just(CodecBackend::Simd), Just(CodecBackend::Galois8)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn any_k_shards_recover_the_message(
        data in prop::collection::vec(any::<u8>(), 0..4096),
        k in 1usize..12,
        m in 1usize..12,
        backend in backend(),
        seed in any::<u64>(),
    ) {
        let config = ErasureConfig::new(k, m).unwrap();
        let mut codec = new_codec(config, backend).unwrap();
        let encoded = codec.encode(&data).unwrap();
        prop_assert_eq!(encoded.len(), k + m);

        // Drop m shards chosen from the seed
        let mut order: Vec<usize> = (0..k + m).collect();
        let mut state = seed;
        for i in (1..order.len()).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            order.swap(i, (state >> 33) as usize % (i + 1));
        }
        let mut shards: Vec<Option<&[u8]>> = encoded.shards().map(Some).collect();
        for &index in order.iter().take(m) {
            shards[index] = None;
        }

        let decoded = codec.decode(&shards, data.len()).unwrap();
        prop_assert_eq!(decoded.data(), data.as_slice());

        // One more hole is one too many
        shards[order[m]] = None;
        let short = codec.decode(&shards, data.len());
        let is_insufficient = matches!(short, Err(Error::InsufficientShards { .. }));
        prop_assert!(is_insufficient);
    }
}
