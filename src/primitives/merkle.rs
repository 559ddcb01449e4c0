// Merkle tree over transaction hashes.
//
// Leaves are sorted lexicographically before pairing. This diverges from
// Bitcoin's insertion-order convention but is the network's established
// root format, so every implementation must reproduce it bit-exactly.
// Inclusion proofs are therefore order-insensitive: each step hashes the
// lexicographically smaller hex string first.

use crate::crypto::hash::double_sha256;

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum MerkleError {
    #[error("cannot build a merkle root from zero hashes")]
    EmptyInput,
    #[error("malformed leaf hash: {0}")]
    BadHex(String),
}

/// Root of the (sorted-leaf) binary hash tree over `tx_hashes`.
pub fn merkle_root(tx_hashes: &[String]) -> Result<String, MerkleError> {
    if tx_hashes.is_empty() {
        return Err(MerkleError::EmptyInput);
    }
    for h in tx_hashes {
        if !is_hash_hex(h) {
            return Err(MerkleError::BadHex(h.clone()));
        }
    }

    let mut layer: Vec<String> = tx_hashes.to_vec();
    layer.sort();

    while layer.len() > 1 {
        if layer.len() % 2 != 0 {
            layer.push(layer.last().cloned().unwrap_or_default());
        }
        let mut next = Vec::with_capacity(layer.len() / 2);
        for pair in layer.chunks(2) {
            next.push(hash_pair(&pair[0], &pair[1]));
        }
        layer = next;
    }

    Ok(layer.remove(0))
}

/// Verify that `tx_hash` is included under `merkle_root` via the sibling
/// hashes in `proof_path`.
pub fn verify_inclusion(tx_hash: &str, expected_root: &str, proof_path: &[String]) -> bool {
    let mut current = tx_hash.to_string();
    for sibling in proof_path {
        current = if current < *sibling {
            hash_pair(&current, sibling)
        } else {
            hash_pair(sibling, &current)
        };
    }
    current == expected_root
}

fn hash_pair(left_hex: &str, right_hex: &str) -> String {
    let mut combined = Vec::with_capacity(64);
    // leaves were validated up front; intermediate hashes are own output
    combined.extend_from_slice(&hex::decode(left_hex).unwrap_or_default());
    combined.extend_from_slice(&hex::decode(right_hex).unwrap_or_default());
    hex::encode(double_sha256(&combined))
}

fn is_hash_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
