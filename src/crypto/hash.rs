// Cryptographic Hashing Wrappers
use sha2::{Digest, Sha256};

/// SHA-256: Used for entry/transaction content hashing
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Double SHA-256 (Bitcoin-style): Used for block identity, Merkle pairs
/// and wire checksums
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// Hex form of a single SHA-256
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Hex form of a double SHA-256
pub fn double_sha256_hex(data: &[u8]) -> String {
    hex::encode(double_sha256(data))
}
