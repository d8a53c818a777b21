//! Fragment envelope, the transport unit for one fragment range
//!
//! Layout: `u32` header length (LE), bincode [`EnvelopeHeader`], then the
//! raw range exactly as written by [`Context::serialize_fragments`].

use crate::context::Context;
use crate::{ReplicatorError, Result};
use bytes::{Buf, BufMut, Bytes};
use fragcast_core::config::FragmentConfig;
use fragcast_core::digest::HashString;
use fragcast_storage::Signature;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    pub block_number: u64,
    /// Root every fragment in the payload must verify against
    pub root: HashString,
    /// Length of the original message in bytes
    pub message_size: u64,
    pub start: u32,
    pub end: u32,
    pub data_shards: u32,
    pub parity_shards: u32,
    pub instance_count: u32,
    /// Sender signatures over the root
    pub signatures: Vec<Signature>,
}

impl EnvelopeHeader {
    /// Header describing fragments `[start, end)` of an initialized context
    pub fn for_range(
        context: &Context,
        block_number: u64,
        message_size: usize,
        start: usize,
        end: usize,
    ) -> Result<Self> {
        let config = context.config();
        Ok(Self {
            block_number,
            root: context.root()?,
            message_size: message_size as u64,
            start: start as u32,
            end: end as u32,
            data_shards: config.data_shards as u32,
            parity_shards: config.parity_shards as u32,
            instance_count: config.instance_count as u32,
            signatures: Vec::new(),
        })
    }

    /// Fragment config announced by the sender; `backend` and `concurrency`
    /// come from `local`
    pub fn fragment_config(&self, local: &FragmentConfig) -> FragmentConfig {
        FragmentConfig {
            data_shards: self.data_shards as usize,
            parity_shards: self.parity_shards as usize,
            instance_count: self.instance_count as usize,
            ..*local
        }
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.start as usize..self.end as usize
    }
}

/// Header plus serialized fragment range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentEnvelope {
    pub header: EnvelopeHeader,
    pub payload: Bytes,
}

impl FragmentEnvelope {
    /// Serialize `header`'s range of `context` straight behind the header
    pub fn seal(context: &Context, header: EnvelopeHeader) -> Result<Bytes> {
        let encoded = bincode::serialize(&header).map_err(fragcast_core::Error::from)?;
        let mut out = Vec::with_capacity(4 + encoded.len());
        out.put_u32_le(encoded.len() as u32);
        out.put_slice(&encoded);
        let offset = out.len();
        let range = header.range();
        context.serialize_fragments(range.start, range.end, &mut out, offset)?;
        Ok(Bytes::from(out))
    }

    /// Encode an envelope whose payload is already serialized
    pub fn encode(&self) -> Result<Bytes> {
        let encoded = bincode::serialize(&self.header).map_err(fragcast_core::Error::from)?;
        let mut out = Vec::with_capacity(4 + encoded.len() + self.payload.len());
        out.put_u32_le(encoded.len() as u32);
        out.put_slice(&encoded);
        out.put_slice(&self.payload);
        Ok(Bytes::from(out))
    }

    /// Split `raw` into header and payload; the payload shares `raw`'s buffer
    pub fn decode(mut raw: Bytes) -> Result<Self> {
        if raw.remaining() < 4 {
            return Err(ReplicatorError::malformed("envelope shorter than its length prefix"));
        }
        let header_len = raw.get_u32_le() as usize;
        if raw.remaining() < header_len {
            return Err(ReplicatorError::malformed(format!(
                "envelope header needs {} bytes, have {}",
                header_len,
                raw.remaining()
            )));
        }
        let header_bytes = raw.split_to(header_len);
        let header: EnvelopeHeader =
            bincode::deserialize(&header_bytes).map_err(fragcast_core::Error::from)?;
        if header.start >= header.end {
            return Err(ReplicatorError::malformed(format!(
                "empty range [{}, {})",
                header.start, header.end
            )));
        }
        Ok(Self {
            header,
            payload: raw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::ThreadPoolBuilder;
    use std::sync::Arc;

    #[test]
    fn test_seal_and_open() {
        let workers = Arc::new(ThreadPoolBuilder::new().num_threads(2).build().unwrap());
        let config = FragmentConfig::new(2, 2, 1);
        let mut sender = Context::new(config, workers.clone()).unwrap();
        let message = b"envelope body".to_vec();
        sender.init_with_message(&message).unwrap();

        let mut header = EnvelopeHeader::for_range(&sender, 9, message.len(), 1, 3).unwrap();
        header.signatures.push(Signature {
            ski: "node-a".to_string(),
            ..Default::default()
        });
        let raw = FragmentEnvelope::seal(&sender, header.clone()).unwrap();

        let envelope = FragmentEnvelope::decode(raw.clone()).unwrap();
        assert_eq!(envelope.header, header);
        assert_eq!(envelope.encode().unwrap(), raw);

        let mut direct = Vec::new();
        sender.serialize_fragments(1, 3, &mut direct, 0).unwrap();
        assert_eq!(&envelope.payload[..], &direct[..]);

        let receiver = Context::new(envelope.header.fragment_config(&config), workers).unwrap();
        receiver
            .validate_and_deserialize_fragments(&header.root, envelope.payload, 1, 3)
            .unwrap();
        assert!(receiver.is_ready());
    }

    #[test]
    fn test_decode_rejects_truncation() {
        assert!(FragmentEnvelope::decode(Bytes::from_static(&[1, 0])).is_err());
        assert!(FragmentEnvelope::decode(Bytes::from_static(&[200, 0, 0, 0, 1])).is_err());
    }
}
