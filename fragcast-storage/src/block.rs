//! Block entity
//!
//! A block is the unit dispersed by the replicator and delivered by the
//! store. It is encoded with bincode; the encoding is what gets fragmented.

use crate::Result;
use bytes::Bytes;
use fragcast_core::digest::{ContentHash, HashString, HASH_LEN};
use serde::{Deserialize, Serialize};

/// Signature made by one participant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Subject key identifier of the signer
    pub ski: String,
    /// Signer public key, when the verifier cannot resolve `ski`
    pub public_key: Option<Bytes>,
    pub digest: Bytes,
}

/// A user request together with the client's signature
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRequest {
    pub payload: Bytes,
    pub signature: Signature,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Bytes,
    pub value: Bytes,
}

/// Reads and writes produced by executing one request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadWriteSet {
    pub contract: String,
    pub ret_code: i32,
    pub reads: Vec<KeyValue>,
    pub writes: Vec<KeyValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    /// Digest of the previous block's header and body
    pub previous_hash: HashString,
    /// Digest of this block's user requests
    pub data_hash: HashString,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockBody {
    pub user_requests: Vec<SignedRequest>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub read_write_sets: Vec<ReadWriteSet>,
    /// One byte per request, non-zero when the request is valid
    pub transaction_filter: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMetadata {
    /// Signatures over header and body, added before execution
    pub consensus_signatures: Vec<Signature>,
    /// Signatures over header, body and execute result, added after execution
    pub validate_signatures: Vec<Signature>,
}

/// An ordered batch of user requests
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub body: BlockBody,
    pub execute_result: ExecuteResult,
    pub metadata: BlockMetadata,
}

impl Block {
    /// Create a block over `user_requests`, filling in the data hash
    pub fn new(number: u64, previous_hash: HashString, user_requests: Vec<SignedRequest>) -> Self {
        let body = BlockBody { user_requests };
        let header = BlockHeader {
            number,
            previous_hash,
            data_hash: Self::compute_data_hash(&body),
        };
        Self {
            header,
            body,
            ..Default::default()
        }
    }

    /// First block of a chain
    pub fn genesis(user_requests: Vec<SignedRequest>) -> Self {
        Self::new(0, [0u8; HASH_LEN], user_requests)
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    /// Digest over the request payloads
    pub fn compute_data_hash(body: &BlockBody) -> HashString {
        let hash = ContentHash::compute_all(
            body.user_requests
                .iter()
                .map(|request| request.payload.as_ref()),
        );
        *hash.as_bytes()
    }

    /// Whether the header's data hash matches the body
    pub fn verify_data_hash(&self) -> bool {
        self.header.data_hash == Self::compute_data_hash(&self.body)
    }

    /// Digest linking the next block to this one
    pub fn chain_hash(&self) -> Result<HashString> {
        let header = bincode::serialize(&self.header)?;
        let body = bincode::serialize(&self.body)?;
        Ok(*ContentHash::compute_all([header.as_slice(), body.as_slice()]).as_bytes())
    }

    /// Binary encoding
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StorageError;

    fn request(payload: &'static [u8]) -> SignedRequest {
        SignedRequest {
            payload: Bytes::from_static(payload),
            signature: Signature {
                ski: "client-1".to_string(),
                public_key: None,
                digest: Bytes::from_static(&[7u8; 64]),
            },
        }
    }

    #[test]
    fn test_block_encoding() {
        let mut block = Block::genesis(vec![request(b"transfer 10"), request(b"transfer 20")]);
        block.execute_result.transaction_filter = vec![1, 0];
        block.execute_result.read_write_sets.push(ReadWriteSet {
            contract: "bank".to_string(),
            ret_code: 0,
            reads: vec![KeyValue {
                key: Bytes::from_static(b"alice"),
                value: Bytes::from_static(b"100"),
            }],
            writes: Vec::new(),
        });

        let raw = block.encode().unwrap();
        let decoded = Block::decode(&raw).unwrap();
        assert_eq!(decoded, block);
        assert!(decoded.verify_data_hash());
    }

    #[test]
    fn test_chaining() {
        let genesis = Block::genesis(vec![request(b"a")]);
        let next = Block::new(1, genesis.chain_hash().unwrap(), vec![request(b"b")]);
        assert_eq!(next.number(), 1);
        assert_eq!(next.header.previous_hash, genesis.chain_hash().unwrap());
        assert_ne!(next.header.data_hash, genesis.header.data_hash);
    }

    #[test]
    fn test_tampered_body_detected() {
        let mut block = Block::genesis(vec![request(b"original")]);
        block.body.user_requests[0].payload = Bytes::from_static(b"forged");
        assert!(!block.verify_data_hash());
    }

    #[test]
    fn test_decode_garbage() {
        let result = Block::decode(&[0xFF; 3]);
        assert!(matches!(result, Err(StorageError::Serialization(_))));
    }
}
