// Pure validators over immutable data. None of these touch chain state;
// linkage and difficulty expectations live in the consensus engine.

use p256::ecdsa::VerifyingKey;

use crate::config::BLOCK_MAX_FUTURE_TIME_SEC;
use crate::consensus::difficulty;
use crate::primitives::merkle;
use crate::primitives::{Block, BlockHeader, DataEntry, Transaction};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("stored hash does not match recomputed hash")]
    BadHash,
    #[error("signature verification failed")]
    BadSignature,
    #[error("merkle root does not match transactions")]
    BadMerkleRoot,
    #[error("block hash does not satisfy its difficulty target")]
    BadDifficulty,
    #[error("block timestamp too far in the future")]
    FutureTimestamp,
    #[error("header timestamp not after its predecessor")]
    NonMonotonicTimestamp,
    #[error("block carries no transactions")]
    EmptyBlock,
    #[error("malformed field: {0}")]
    MalformedField(&'static str),
}

/// An entry is valid iff its content hash recomputes.
pub fn verify_entry(entry: &DataEntry) -> bool {
    entry.data_hash == entry.recompute_hash()
}

/// A transaction is valid iff every entry is valid and the tx hash
/// recomputes over them.
pub fn verify_transaction(tx: &Transaction) -> bool {
    !tx.entries.is_empty() && tx.entries.iter().all(verify_entry) && tx.tx_hash == tx.recompute_hash()
}

/// Signature check: ECDSA P-256 over the raw tx hash bytes.
pub fn verify_transaction_signature(
    public_key: &VerifyingKey,
    tx_hash_hex: &str,
    signature_hex: &str,
) -> bool {
    crate::crypto::keys::verify_signature(public_key, tx_hash_hex, signature_hex)
}

/// Structural block check: timestamp drift, hash integrity, proof-of-work,
/// merkle commitment, coinbase position, and every transaction's own
/// integrity. Parent linkage is deliberately not checked here.
pub fn verify_block(block: &Block, now: u64) -> Result<(), ValidationError> {
    if block.timestamp > now + BLOCK_MAX_FUTURE_TIME_SEC {
        return Err(ValidationError::FutureTimestamp);
    }
    if block.data.is_empty() {
        return Err(ValidationError::EmptyBlock);
    }
    if !block.data[0].is_coinbase() {
        return Err(ValidationError::MalformedField("first transaction must be coinbase"));
    }
    if block.recompute_hash() != block.hash {
        return Err(ValidationError::BadHash);
    }
    if !difficulty::hash_meets_target(&block.hash, &block.bits) {
        return Err(ValidationError::BadDifficulty);
    }

    let tx_hashes: Vec<String> = block.data.iter().map(|tx| tx.tx_hash.clone()).collect();
    match merkle::merkle_root(&tx_hashes) {
        Ok(root) if root == block.merkle_root => {}
        _ => return Err(ValidationError::BadMerkleRoot),
    }

    if !block.data.iter().all(verify_transaction) {
        return Err(ValidationError::BadHash);
    }
    Ok(())
}

/// Verify a run of headers against a known anchor `(hash, timestamp)`:
/// each must link to the running hash, satisfy its declared proof-of-work,
/// and carry a strictly increasing timestamp. Fails on the first violation.
pub fn verify_header_chain(
    headers: &[BlockHeader],
    anchor_hash: &str,
    anchor_timestamp: u64,
) -> Result<(), ValidationError> {
    let mut last_hash = anchor_hash.to_string();
    let mut last_timestamp = anchor_timestamp;

    for header in headers {
        let prev = header
            .previous_hash
            .as_deref()
            .ok_or(ValidationError::MalformedField("previous_hash"))?;
        if prev != last_hash {
            return Err(ValidationError::BadHash);
        }
        if header.hash.len() != 64 || hex::decode(&header.hash).is_err() {
            return Err(ValidationError::MalformedField("hash"));
        }
        if !difficulty::hash_meets_target(&header.hash, &header.bits) {
            return Err(ValidationError::BadDifficulty);
        }
        if header.timestamp <= last_timestamp {
            return Err(ValidationError::NonMonotonicTimestamp);
        }
        last_hash = header.hash.clone();
        last_timestamp = header.timestamp;
    }
    Ok(())
}
