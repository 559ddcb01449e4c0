// Data Structures: DataEntry
//
// The atomic ledger record: one reading or payload from one source.
// Entries are immutable; the content hash commits to every other field.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crypto::hash::sha256_hex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEntry {
    pub source_id: String,
    pub data_type: String,
    #[serde(with = "hex_bytes")]
    pub value: Vec<u8>,
    pub timestamp: f64,
    pub previous_hash: Option<String>,
    pub nonce: u64,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub data_hash: String,
}

impl DataEntry {
    /// Build an entry stamped with the current time.
    pub fn new(
        source_id: String,
        data_type: String,
        value: Vec<u8>,
        nonce: u64,
        previous_hash: Option<String>,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self::new_at(
            source_id,
            data_type,
            value,
            super::unix_now_f64(),
            nonce,
            previous_hash,
            metadata,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_at(
        source_id: String,
        data_type: String,
        value: Vec<u8>,
        timestamp: f64,
        nonce: u64,
        previous_hash: Option<String>,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        let data_hash = compute_entry_hash(
            &source_id,
            &data_type,
            &value,
            timestamp,
            nonce,
            previous_hash.as_deref(),
            &metadata,
        );
        DataEntry {
            source_id,
            data_type,
            value,
            timestamp,
            previous_hash,
            nonce,
            metadata,
            data_hash,
        }
    }

    /// Recompute the content hash from the stored fields.
    pub fn recompute_hash(&self) -> String {
        compute_entry_hash(
            &self.source_id,
            &self.data_type,
            &self.value,
            self.timestamp,
            self.nonce,
            self.previous_hash.as_deref(),
            &self.metadata,
        )
    }
}

// Canonical binary encoding for hashing: length-prefixed strings and bytes,
// little-endian scalars, a presence flag plus 32 raw bytes for the optional
// previous hash, and sort-keyed JSON for the metadata map.
fn compute_entry_hash(
    source_id: &str,
    data_type: &str,
    value: &[u8],
    timestamp: f64,
    nonce: u64,
    previous_hash: Option<&str>,
    metadata: &BTreeMap<String, serde_json::Value>,
) -> String {
    let metadata_json = serde_json::to_vec(metadata).unwrap_or_default();

    let mut buf = Vec::with_capacity(
        4 * 4 + source_id.len() + data_type.len() + value.len() + 8 + 8 + 33 + metadata_json.len(),
    );
    push_chunk(&mut buf, source_id.as_bytes());
    push_chunk(&mut buf, data_type.as_bytes());
    push_chunk(&mut buf, value);
    buf.extend_from_slice(&timestamp.to_le_bytes());
    buf.extend_from_slice(&nonce.to_le_bytes());
    match previous_hash.and_then(|h| hex::decode(h).ok()) {
        Some(prev) if prev.len() == 32 => {
            buf.push(1);
            buf.extend_from_slice(&prev);
        }
        _ => {
            buf.push(0);
            buf.extend_from_slice(&[0u8; 32]);
        }
    }
    push_chunk(&mut buf, &metadata_json);

    sha256_hex(&buf)
}

fn push_chunk(buf: &mut Vec<u8>, chunk: &[u8]) {
    buf.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
    buf.extend_from_slice(chunk);
}

/// Serde adapter: binary `value` travels as lowercase hex on the wire and
/// in the persisted chain file.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
