// Data Structures: Transaction
//
// A transaction bundles one or more data entries under a single hash and
// optional ECDSA signature. The hash covers the timestamp and the entry
// hashes only; fee, size and fee_rate are relay economics, not identity.

use serde::{Deserialize, Serialize};

use super::entry::DataEntry;
use crate::crypto::hash::sha256_hex;

pub const COINBASE_DATA_TYPE: &str = "coinbase";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub entries: Vec<DataEntry>,
    pub timestamp: f64,
    pub tx_hash: String,
    pub signature: Option<String>,
    #[serde(default)]
    pub fee: u64,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub fee_rate: f64,
}

impl Transaction {
    pub fn build(entries: Vec<DataEntry>, timestamp: f64, signature: Option<String>, fee: u64) -> Self {
        let tx_hash = compute_tx_hash(timestamp, &entries);
        let size_bytes = estimate_size(&entries);
        let fee_rate = if size_bytes > 0 {
            fee as f64 / size_bytes as f64
        } else {
            0.0
        };
        Transaction {
            entries,
            timestamp,
            tx_hash,
            signature,
            fee,
            size_bytes,
            fee_rate,
        }
    }

    /// The miner's reward record: first transaction of every block, never
    /// signed, single entry tagged as coinbase.
    pub fn coinbase(miner_address: &str, height: u64, timestamp: f64) -> Self {
        let entry = DataEntry::new_at(
            miner_address.to_string(),
            COINBASE_DATA_TYPE.to_string(),
            format!("height:{height}").into_bytes(),
            timestamp,
            height,
            None,
            Default::default(),
        );
        Self::build(vec![entry], timestamp, None, 0)
    }

    pub fn is_coinbase(&self) -> bool {
        self.signature.is_none()
            && self.entries.len() == 1
            && self.entries[0].data_type == COINBASE_DATA_TYPE
    }

    pub fn recompute_hash(&self) -> String {
        compute_tx_hash(self.timestamp, &self.entries)
    }

    /// A copy carrying the given signature; the hash is unchanged since the
    /// signature is outside the hashed fields.
    pub fn with_signature(mut self, signature_hex: String) -> Self {
        self.signature = Some(signature_hex);
        self
    }
}

// tx_hash = SHA256(timestamp_le_f64 || entry_hash_32 || entry_hash_32 || ...)
fn compute_tx_hash(timestamp: f64, entries: &[DataEntry]) -> String {
    let mut buf = Vec::with_capacity(8 + entries.len() * 32);
    buf.extend_from_slice(&timestamp.to_le_bytes());
    for entry in entries {
        match hex::decode(&entry.data_hash) {
            Ok(raw) if raw.len() == 32 => buf.extend_from_slice(&raw),
            // Malformed entry hashes still hash deterministically; the
            // validators reject the entry itself.
            _ => buf.extend_from_slice(&[0u8; 32]),
        }
    }
    sha256_hex(&buf)
}

fn estimate_size(entries: &[DataEntry]) -> u64 {
    entries
        .iter()
        .map(|e| serde_json::to_vec(e).map(|v| v.len() as u64).unwrap_or(0))
        .sum()
}
