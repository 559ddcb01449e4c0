// Data Structures: Block
//
// Block identity is the double SHA-256 of a fixed 92-byte binary header:
//
//   index        u64 LE      8
//   timestamp    f64 LE      8
//   previous     raw        32   (all zero when None)
//   bits         raw         4
//   merkle_root  raw        32
//   nonce        u64 LE      8
//
// The nonce occupies the final 8 bytes so the miner can pack the template
// once and rewrite only the tail per attempt.

use serde::{Deserialize, Serialize};

use super::transaction::Transaction;
use crate::crypto::hash::double_sha256_hex;

pub const BLOCK_HEADER_BYTES: usize = 92;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub timestamp: u64,
    pub previous_hash: Option<String>,
    pub bits: String,
    pub merkle_root: String,
    pub data: Vec<Transaction>,
    pub nonce: u64,
    pub hash: String,
    #[serde(default)]
    pub mining_time: Option<f64>,
}

impl Block {
    #[allow(clippy::too_many_arguments)]
    pub fn sealed(
        index: u64,
        timestamp: u64,
        previous_hash: Option<String>,
        bits: String,
        merkle_root: String,
        data: Vec<Transaction>,
        nonce: u64,
        mining_time: Option<f64>,
    ) -> Self {
        let hash = compute_block_hash(
            index,
            timestamp,
            previous_hash.as_deref(),
            &bits,
            &merkle_root,
            nonce,
        );
        Block {
            index,
            timestamp,
            previous_hash,
            bits,
            merkle_root,
            data,
            nonce,
            hash,
            mining_time,
        }
    }

    pub fn recompute_hash(&self) -> String {
        compute_block_hash(
            self.index,
            self.timestamp,
            self.previous_hash.as_deref(),
            &self.bits,
            &self.merkle_root,
            self.nonce,
        )
    }

    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            index: self.index,
            timestamp: self.timestamp,
            previous_hash: self.previous_hash.clone(),
            bits: self.bits.clone(),
            merkle_root: self.merkle_root.clone(),
            nonce: self.nonce,
            hash: self.hash.clone(),
        }
    }
}

/// A block without its transactions, as exchanged in `headers` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub index: u64,
    pub timestamp: u64,
    pub previous_hash: Option<String>,
    pub bits: String,
    pub merkle_root: String,
    pub nonce: u64,
    pub hash: String,
}

impl BlockHeader {
    pub fn recompute_hash(&self) -> String {
        compute_block_hash(
            self.index,
            self.timestamp,
            self.previous_hash.as_deref(),
            &self.bits,
            &self.merkle_root,
            self.nonce,
        )
    }
}

/// Pack the 92-byte header. Malformed hex in any field degrades to zero
/// bytes; validators reject such blocks by hash mismatch.
pub fn pack_header(
    index: u64,
    timestamp: u64,
    previous_hash: Option<&str>,
    bits: &str,
    merkle_root: &str,
    nonce: u64,
) -> [u8; BLOCK_HEADER_BYTES] {
    let mut buf = [0u8; BLOCK_HEADER_BYTES];
    buf[0..8].copy_from_slice(&index.to_le_bytes());
    buf[8..16].copy_from_slice(&(timestamp as f64).to_le_bytes());
    if let Some(prev) = previous_hash.and_then(|h| hex::decode(h).ok()) {
        if prev.len() == 32 {
            buf[16..48].copy_from_slice(&prev);
        }
    }
    if let Ok(b) = hex::decode(bits) {
        if b.len() == 4 {
            buf[48..52].copy_from_slice(&b);
        }
    }
    if let Ok(root) = hex::decode(merkle_root) {
        if root.len() == 32 {
            buf[52..84].copy_from_slice(&root);
        }
    }
    buf[84..92].copy_from_slice(&nonce.to_le_bytes());
    buf
}

pub fn compute_block_hash(
    index: u64,
    timestamp: u64,
    previous_hash: Option<&str>,
    bits: &str,
    merkle_root: &str,
    nonce: u64,
) -> String {
    let header = pack_header(index, timestamp, previous_hash, bits, merkle_root, nonce);
    double_sha256_hex(&header)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> String {
        "aa".repeat(32)
    }

    #[test]
    fn test_header_size() {
        let buf = pack_header(0, 0, None, "207fffff", &root(), 0);
        assert_eq!(buf.len(), BLOCK_HEADER_BYTES);
        // Manual field count: 8 + 8 + 32 + 4 + 32 + 8
        assert_eq!(8 + 8 + 32 + 4 + 32 + 8, BLOCK_HEADER_BYTES);
    }

    #[test]
    fn test_hash_deterministic_and_nonce_sensitive() {
        let h1 = compute_block_hash(1, 1000, Some(&"bb".repeat(32)), "207fffff", &root(), 5);
        let h2 = compute_block_hash(1, 1000, Some(&"bb".repeat(32)), "207fffff", &root(), 5);
        let h3 = compute_block_hash(1, 1000, Some(&"bb".repeat(32)), "207fffff", &root(), 6);
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
    }

    #[test]
    fn test_none_previous_is_zero_bytes() {
        let with_none = pack_header(0, 0, None, "207fffff", &root(), 0);
        let with_zero = pack_header(0, 0, Some(&"00".repeat(32)), "207fffff", &root(), 0);
        assert_eq!(with_none, with_zero);
    }

    #[test]
    fn test_sealed_block_hash_matches() {
        let b = Block::sealed(0, 1000, None, "207fffff".into(), root(), vec![], 7, None);
        assert_eq!(b.hash, b.recompute_hash());
        assert_eq!(b.header().recompute_hash(), b.hash);
    }

    #[test]
    fn test_serde_roundtrip() {
        let b = Block::sealed(
            3,
            1234,
            Some("cc".repeat(32)),
            "207fffff".into(),
            root(),
            vec![],
            99,
            Some(0.5),
        );
        let json = serde_json::to_string(&b).unwrap();
        let back: Block = serde_json::from_str(&json).unwrap();
        assert_eq!(back, b);
    }
}
