// Atomic on-disk chain snapshot.
//
// Layout: one JSON file per node, {"chain": [block, ...]} with every
// bytes-typed field hex-encoded. Writes go to a temp file in the same
// directory, are fsynced, then renamed over the destination, so a reader
// never observes a partial file. Loads re-verify everything; a chain that
// fails any check is discarded and the node starts empty.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::consensus::validate;
use crate::primitives::{unix_now, Block};

#[derive(Serialize, Deserialize)]
struct PersistedChain {
    chain: Vec<Block>,
}

#[derive(Clone)]
pub struct ChainStore {
    path: PathBuf,
}

impl ChainStore {
    pub fn new(data_dir: &str) -> Self {
        ChainStore {
            path: Path::new(data_dir).join("chain.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, chain: &[Block]) -> bool {
        match self.try_save(chain) {
            Ok(()) => true,
            Err(e) => {
                eprintln!("[persist] save failed: {e}");
                false
            }
        }
    }

    fn try_save(&self, chain: &[Block]) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let doc = PersistedChain { chain: chain.to_vec() };
        let json = serde_json::to_vec_pretty(&doc)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let tmp = self.path.with_extension(format!("json.tmp.{}", std::process::id()));
        {
            let mut f = std::fs::File::create(&tmp)?;
            f.write_all(&json)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Load and fully re-verify the persisted chain. Any integrity failure
    /// returns `None`.
    pub fn load(&self) -> Option<Vec<Block>> {
        let raw = match std::fs::read(&self.path) {
            Ok(r) => r,
            Err(_) => return None,
        };
        let doc: PersistedChain = match serde_json::from_slice(&raw) {
            Ok(d) => d,
            Err(e) => {
                eprintln!("[persist] chain file corrupt (json): {e}");
                return None;
            }
        };
        match verify_chain(&doc.chain) {
            Ok(()) => Some(doc.chain),
            Err(reason) => {
                eprintln!("[persist] chain file failed verification: {reason}");
                None
            }
        }
    }
}

// Every data_hash, tx_hash, merkle root, block hash and link must hold.
fn verify_chain(chain: &[Block]) -> Result<(), String> {
    let now = unix_now();
    for (i, block) in chain.iter().enumerate() {
        if block.index != i as u64 {
            return Err(format!("block {} has index {}", i, block.index));
        }
        if let Err(e) = validate::verify_block(block, now) {
            return Err(format!("block {i}: {e}"));
        }
        match (i, &block.previous_hash) {
            (0, None) => {}
            (0, Some(_)) => return Err("genesis has a previous hash".to_string()),
            (_, None) => return Err(format!("block {i} missing previous hash")),
            (_, Some(prev)) => {
                if *prev != chain[i - 1].hash {
                    return Err(format!("block {i} does not link to its parent"));
                }
            }
        }
    }
    Ok(())
}
