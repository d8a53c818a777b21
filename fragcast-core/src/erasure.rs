//! Reed-Solomon Erasure Coding
//!
//! k-of-(k+m) coding behind the [`ErasureCodec`] trait:
//! - `encode` splits a buffer into k data shards (zero padded) plus m parity shards
//! - `decode` recovers the original bytes from any k equal-length shards
//!
//! Two backends are available and one is bound when a codec is constructed:
//! - [`CodecBackend::Simd`]: `reed-solomon-simd`, preferred
//! - [`CodecBackend::Galois8`]: `reed-solomon-erasure` over GF(2^8), fallback
//!
//! Both sides of a transfer must use the same backend; shards produced by one
//! backend are not decodable by the other.

use crate::error::{Error, Result};
use crate::metrics::names;
use crate::{DATA_SHARDS, PARITY_SHARDS};
use metrics::counter;
use reed_solomon_erasure::galois_8::ReedSolomon;
use reed_solomon_simd::{ReedSolomonDecoder, ReedSolomonEncoder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// GF(2^8) limits the total shard count
const GALOIS8_MAX_SHARDS: usize = 256;

/// Erasure coding configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErasureConfig {
    /// Number of data shards (k)
    pub data_shards: usize,
    /// Number of parity shards (m)
    pub parity_shards: usize,
}

impl Default for ErasureConfig {
    fn default() -> Self {
        Self {
            data_shards: DATA_SHARDS,
            parity_shards: PARITY_SHARDS,
        }
    }
}

impl ErasureConfig {
    /// Create a new erasure config
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        if data_shards == 0 {
            return Err(Error::Configuration("data_shards must be > 0".to_string()));
        }
        if parity_shards == 0 {
            return Err(Error::Configuration(
                "parity_shards must be > 0".to_string(),
            ));
        }
        Ok(Self {
            data_shards,
            parity_shards,
        })
    }

    /// Total number of shards
    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Storage overhead ratio (parity/data)
    pub fn overhead_ratio(&self) -> f64 {
        self.parity_shards as f64 / self.data_shards as f64
    }

    /// Maximum number of lost shards that can be tolerated
    pub fn max_failures(&self) -> usize {
        self.parity_shards
    }

    /// Shard length for a payload of `data_len` bytes (never zero)
    pub fn shard_len(&self, data_len: usize) -> usize {
        data_len.div_ceil(self.data_shards).max(1)
    }
}

/// Erasure backend implementation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecBackend {
    /// SIMD accelerated Leopard-style codec
    #[default]
    Simd,
    /// Classic Vandermonde codec over GF(2^8)
    Galois8,
}

impl CodecBackend {
    /// Whether this backend can be instantiated for `config`
    pub fn supports(self, config: &ErasureConfig) -> bool {
        if config.data_shards == 0 || config.parity_shards == 0 {
            return false;
        }
        match self {
            CodecBackend::Simd => {
                ReedSolomonEncoder::supports(config.data_shards, config.parity_shards)
            }
            CodecBackend::Galois8 => config.total_shards() <= GALOIS8_MAX_SHARDS,
        }
    }

    /// The backend tried when this one is unavailable
    pub fn fallback(self) -> Self {
        match self {
            CodecBackend::Simd => CodecBackend::Galois8,
            CodecBackend::Galois8 => CodecBackend::Simd,
        }
    }

    /// Backend actually bound for `config` when `self` is preferred
    pub fn resolve(self, config: &ErasureConfig) -> Option<Self> {
        [self, self.fallback()]
            .into_iter()
            .find(|backend| backend.supports(config))
    }
}

/// Shards produced by one encode call
///
/// All shards live in one contiguous buffer owned by the result; the slices
/// returned by [`EncodeResult::shard`] borrow from it and cannot outlive it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeResult {
    buffer: Vec<u8>,
    shard_len: usize,
    data_shards: usize,
}

impl EncodeResult {
    fn new(buffer: Vec<u8>, shard_len: usize, data_shards: usize) -> Self {
        debug_assert_eq!(buffer.len() % shard_len, 0);
        Self {
            buffer,
            shard_len,
            data_shards,
        }
    }

    /// Number of shards (k + m)
    pub fn len(&self) -> usize {
        self.buffer.len() / self.shard_len
    }

    /// Always false, an encode result holds at least two shards
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Length in bytes of every shard
    pub fn shard_len(&self) -> usize {
        self.shard_len
    }

    /// Borrow shard `index`
    pub fn shard(&self, index: usize) -> Option<&[u8]> {
        let start = index.checked_mul(self.shard_len)?;
        self.buffer.get(start..start + self.shard_len)
    }

    /// Iterate over all shards in index order
    pub fn shards(&self) -> impl ExactSizeIterator<Item = &[u8]> + '_ {
        self.buffer.chunks(self.shard_len)
    }

    /// Whether shard `index` is a parity shard
    pub fn is_parity(&self, index: usize) -> bool {
        index >= self.data_shards
    }
}

/// Original bytes recovered by one decode call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeResult {
    data: Vec<u8>,
}

impl DecodeResult {
    /// Borrow the recovered bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Take ownership of the recovered bytes
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

/// A k-of-(k+m) erasure codec instance
///
/// Instances keep backend state between calls, so one instance must not be
/// used by two threads at once; pools hand them out exclusively.
pub trait ErasureCodec: Send {
    /// Encode `data` into exactly k + m equal-length shards
    fn encode(&mut self, data: &[u8]) -> Result<EncodeResult>;

    /// Recover the first `data_len` bytes from `shards`
    ///
    /// `shards` must have k + m entries; `None` or empty entries are holes.
    fn decode(&mut self, shards: &[Option<&[u8]>], data_len: usize) -> Result<DecodeResult>;
}

/// Construct a codec for `config`, falling back when `preferred` cannot serve it
pub fn new_codec(config: ErasureConfig, preferred: CodecBackend) -> Result<Box<dyn ErasureCodec>> {
    let backend = preferred.resolve(&config).ok_or(Error::CodecUnavailable {
        data_shards: config.data_shards,
        parity_shards: config.parity_shards,
    })?;
    if backend != preferred {
        counter!(names::CODEC_FALLBACKS).increment(1);
        warn!(
            ?preferred,
            ?backend,
            data_shards = config.data_shards,
            parity_shards = config.parity_shards,
            "Preferred erasure backend not available, switching"
        );
    }
    let codec: Box<dyn ErasureCodec> = match backend {
        CodecBackend::Simd => Box::new(SimdCodec::new(config)?),
        CodecBackend::Galois8 => Box::new(Galois8Codec::new(config)?),
    };
    Ok(codec)
}

/// Check a decode input and return the common shard length
fn check_shards(config: &ErasureConfig, shards: &[Option<&[u8]>]) -> Result<usize> {
    if shards.len() != config.total_shards() {
        return Err(Error::ShardSizeMismatch {
            expected: config.total_shards(),
            actual: shards.len(),
        });
    }

    let mut present = shards.iter().flatten().filter(|s| !s.is_empty());
    let shard_len = present
        .next()
        .map(|s| s.len())
        .ok_or(Error::InsufficientShards {
            available: 0,
            required: config.data_shards,
        })?;

    let mut available = 1;
    for shard in present {
        if shard.len() != shard_len {
            return Err(Error::ShardSizeMismatch {
                expected: shard_len,
                actual: shard.len(),
            });
        }
        available += 1;
    }
    if available < config.data_shards {
        return Err(Error::InsufficientShards {
            available,
            required: config.data_shards,
        });
    }
    Ok(shard_len)
}

fn present<'a>(shard: &Option<&'a [u8]>) -> Option<&'a [u8]> {
    shard.filter(|s| !s.is_empty())
}

/// Concatenate the data shards when none of them is missing
fn concat_if_complete(
    config: &ErasureConfig,
    shards: &[Option<&[u8]>],
    data_len: usize,
) -> Option<Vec<u8>> {
    let originals = &shards[..config.data_shards];
    if !originals.iter().all(|s| present(s).is_some()) {
        return None;
    }
    let mut data = Vec::with_capacity(data_len);
    for shard in originals.iter().filter_map(present) {
        let take = (data_len - data.len()).min(shard.len());
        data.extend_from_slice(&shard[..take]);
        if data.len() == data_len {
            break;
        }
    }
    Some(data)
}

fn check_capacity(config: &ErasureConfig, shard_len: usize, data_len: usize) -> Result<()> {
    let capacity = shard_len * config.data_shards;
    if data_len > capacity {
        return Err(Error::ErasureCoding(format!(
            "requested {} bytes but shards only carry {}",
            data_len, capacity
        )));
    }
    Ok(())
}

/// `reed-solomon-erasure` backend
pub struct Galois8Codec {
    config: ErasureConfig,
    rs: ReedSolomon,
}

impl Galois8Codec {
    pub fn new(config: ErasureConfig) -> Result<Self> {
        let rs = ReedSolomon::new(config.data_shards, config.parity_shards)?;
        Ok(Self { config, rs })
    }
}

impl ErasureCodec for Galois8Codec {
    fn encode(&mut self, data: &[u8]) -> Result<EncodeResult> {
        let shard_len = self.config.shard_len(data.len());
        let mut buffer = vec![0u8; shard_len * self.config.total_shards()];
        buffer[..data.len()].copy_from_slice(data);

        let mut shards: Vec<&mut [u8]> = buffer.chunks_mut(shard_len).collect();
        self.rs.encode(&mut shards)?;

        Ok(EncodeResult::new(buffer, shard_len, self.config.data_shards))
    }

    fn decode(&mut self, shards: &[Option<&[u8]>], data_len: usize) -> Result<DecodeResult> {
        let shard_len = check_shards(&self.config, shards)?;
        check_capacity(&self.config, shard_len, data_len)?;
        if let Some(data) = concat_if_complete(&self.config, shards, data_len) {
            return Ok(DecodeResult { data });
        }

        let mut work: Vec<Option<Vec<u8>>> = shards
            .iter()
            .map(|s| present(s).map(<[u8]>::to_vec))
            .collect();
        self.rs.reconstruct_data(&mut work)?;

        let mut data = Vec::with_capacity(shard_len * self.config.data_shards);
        for shard in work.iter().take(self.config.data_shards) {
            match shard {
                Some(shard) => data.extend_from_slice(shard),
                None => return Err(Error::Internal("Reconstruction failed".to_string())),
            }
        }
        data.truncate(data_len);
        Ok(DecodeResult { data })
    }
}

/// `reed-solomon-simd` backend
///
/// Shard length is rounded up to an even number of bytes.
pub struct SimdCodec {
    config: ErasureConfig,
    encoder: Option<ReedSolomonEncoder>,
    decoder: Option<ReedSolomonDecoder>,
}

impl SimdCodec {
    pub fn new(config: ErasureConfig) -> Result<Self> {
        if !CodecBackend::Simd.supports(&config) {
            return Err(Error::CodecUnavailable {
                data_shards: config.data_shards,
                parity_shards: config.parity_shards,
            });
        }
        Ok(Self {
            config,
            encoder: None,
            decoder: None,
        })
    }

    fn shard_len(&self, data_len: usize) -> usize {
        let len = self.config.shard_len(data_len);
        len + (len & 1)
    }

    fn encoder(&mut self, shard_len: usize) -> Result<&mut ReedSolomonEncoder> {
        let (k, m) = (self.config.data_shards, self.config.parity_shards);
        match self.encoder.as_mut() {
            Some(encoder) => encoder.reset(k, m, shard_len)?,
            None => self.encoder = Some(ReedSolomonEncoder::new(k, m, shard_len)?),
        }
        self.encoder
            .as_mut()
            .ok_or_else(|| Error::Internal("encoder missing".to_string()))
    }

    fn decoder(&mut self, shard_len: usize) -> Result<&mut ReedSolomonDecoder> {
        let (k, m) = (self.config.data_shards, self.config.parity_shards);
        match self.decoder.as_mut() {
            Some(decoder) => decoder.reset(k, m, shard_len)?,
            None => self.decoder = Some(ReedSolomonDecoder::new(k, m, shard_len)?),
        }
        self.decoder
            .as_mut()
            .ok_or_else(|| Error::Internal("decoder missing".to_string()))
    }
}

impl ErasureCodec for SimdCodec {
    fn encode(&mut self, data: &[u8]) -> Result<EncodeResult> {
        let data_shards = self.config.data_shards;
        let shard_len = self.shard_len(data.len());
        let mut buffer = vec![0u8; shard_len * self.config.total_shards()];
        buffer[..data.len()].copy_from_slice(data);

        let (originals, recovery) = buffer.split_at_mut(shard_len * data_shards);
        let encoder = self.encoder(shard_len)?;
        for shard in originals.chunks(shard_len) {
            encoder.add_original_shard(shard)?;
        }
        let result = encoder.encode()?;
        for (dst, src) in recovery.chunks_mut(shard_len).zip(result.recovery_iter()) {
            dst.copy_from_slice(src);
        }

        Ok(EncodeResult::new(buffer, shard_len, data_shards))
    }

    fn decode(&mut self, shards: &[Option<&[u8]>], data_len: usize) -> Result<DecodeResult> {
        let shard_len = check_shards(&self.config, shards)?;
        check_capacity(&self.config, shard_len, data_len)?;
        if let Some(data) = concat_if_complete(&self.config, shards, data_len) {
            return Ok(DecodeResult { data });
        }

        let data_shards = self.config.data_shards;
        let decoder = self.decoder(shard_len)?;
        for (index, shard) in shards.iter().enumerate() {
            let Some(shard) = present(shard) else {
                continue;
            };
            if index < data_shards {
                decoder.add_original_shard(index, shard)?;
            } else {
                decoder.add_recovery_shard(index - data_shards, shard)?;
            }
        }
        let result = decoder.decode()?;

        let mut data = Vec::with_capacity(shard_len * data_shards);
        for (index, shard) in shards.iter().take(data_shards).enumerate() {
            match present(shard).or_else(|| result.restored_original(index)) {
                Some(shard) => data.extend_from_slice(shard),
                None => return Err(Error::Internal("Reconstruction failed".to_string())),
            }
        }
        data.truncate(data_len);
        debug!(data_len, shard_len, "Recovered missing original shards");
        Ok(DecodeResult { data })
    }
}
