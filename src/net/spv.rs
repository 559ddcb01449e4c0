// SPV: a headers-only chain plus Merkle inclusion proofs.
//
// The SPV role never stores bodies, never validates transactions and never
// mines; it tracks the best header chain and can answer "is this tx in
// that block?" given a proof path.

use std::net::SocketAddr;

use tokio::net::TcpStream;

use crate::config::PROTOCOL_VERSION;
use crate::consensus::difficulty;
use crate::consensus::validate;
use crate::net::protocol::{
    FramedStream, GetHeadersPayload, Message, ProtocolError, VersionPayload,
};
use crate::primitives::{merkle, unix_now, BlockHeader};

#[derive(Default)]
pub struct HeaderChain {
    headers: Vec<BlockHeader>,
}

impl HeaderChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn height(&self) -> i64 {
        self.headers.last().map(|h| h.index as i64).unwrap_or(-1)
    }

    pub fn tip(&self) -> Option<&BlockHeader> {
        self.headers.last()
    }

    pub fn header_by_hash(&self, hash: &str) -> Option<&BlockHeader> {
        self.headers.iter().rev().find(|h| h.hash == hash)
    }

    pub fn locator(&self) -> Vec<String> {
        self.headers.first().map(|h| vec![h.hash.clone()]).unwrap_or_default()
    }

    /// Append a validated run of headers. The run must anchor at the
    /// current tip (or start at genesis on an empty chain); headers we
    /// already have at the front of the run are skipped.
    pub fn accept_headers(&mut self, mut incoming: Vec<BlockHeader>) -> Result<usize, validate::ValidationError> {
        // drop the prefix already known
        let next_index = (self.height() + 1) as u64;
        incoming.retain(|h| h.index >= next_index);
        if incoming.is_empty() {
            return Ok(0);
        }

        match self.headers.last() {
            None => {
                let first = &incoming[0];
                if first.index != 0 || first.previous_hash.is_some() {
                    return Err(validate::ValidationError::MalformedField("first header is not genesis"));
                }
                if first.recompute_hash() != first.hash {
                    return Err(validate::ValidationError::BadHash);
                }
                if !difficulty::hash_meets_target(&first.hash, &first.bits) {
                    return Err(validate::ValidationError::BadDifficulty);
                }
                validate::verify_header_chain(&incoming[1..], &first.hash, first.timestamp)?;
            }
            Some(tip) => {
                validate::verify_header_chain(&incoming, &tip.hash, tip.timestamp)?;
            }
        }

        let added = incoming.len();
        self.headers.extend(incoming);
        Ok(added)
    }

    /// Check a transaction's inclusion in a block we hold the header of.
    pub fn verify_inclusion(&self, tx_hash: &str, block_hash: &str, proof_path: &[String]) -> bool {
        match self.header_by_hash(block_hash) {
            Some(header) => merkle::verify_inclusion(tx_hash, &header.merkle_root, proof_path),
            None => false,
        }
    }
}

/// Minimal SPV session: handshake with one peer, follow its headers.
/// Runs until the connection drops.
pub async fn run_spv_session(seed: SocketAddr) -> Result<(), ProtocolError> {
    let mut chain = HeaderChain::new();
    let stream = TcpStream::connect(seed).await?;
    let mut s = FramedStream::new(stream);
    eprintln!("[spv] connected to {seed}");

    s.send(&Message::Version(VersionPayload {
        protocol_version: PROTOCOL_VERSION,
        services: 0,
        timestamp: unix_now(),
        best_height: chain.height(),
    }))
    .await?;

    while let Some(msg) = s.recv().await? {
        match msg {
            Message::Version(v) => {
                eprintln!("[spv] peer height {}", v.best_height);
                if v.best_height > chain.height() {
                    s.send(&Message::GetHeaders(GetHeadersPayload {
                        protocol_version: PROTOCOL_VERSION,
                        locator_hashes: chain.locator(),
                        hash_stop: "0".repeat(64),
                    }))
                    .await?;
                }
            }
            Message::Headers(p) => match chain.accept_headers(p.headers) {
                Ok(0) => {}
                Ok(n) => eprintln!("[spv] accepted {n} header(s), height now {}", chain.height()),
                Err(e) => eprintln!("[spv] rejected header run: {e}"),
            },
            Message::Inv(_) => {
                // block announcements: refresh headers rather than fetch bodies
                s.send(&Message::GetHeaders(GetHeadersPayload {
                    protocol_version: PROTOCOL_VERSION,
                    locator_hashes: chain.locator(),
                    hash_stop: "0".repeat(64),
                }))
                .await?;
            }
            _ => {}
        }
    }
    eprintln!("[spv] peer {seed} closed the connection");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::difficulty::MAX_BITS;
    use crate::primitives::{Block, Transaction};

    fn mine(index: u64, timestamp: u64, previous: Option<String>) -> Block {
        let cb = Transaction::coinbase("miner", index, timestamp as f64);
        let root = merkle::merkle_root(&[cb.tx_hash.clone()]).unwrap();
        let mut nonce = 0u64;
        loop {
            let b = Block::sealed(
                index,
                timestamp,
                previous.clone(),
                MAX_BITS.into(),
                root.clone(),
                vec![cb.clone()],
                nonce,
                None,
            );
            if difficulty::hash_meets_target(&b.hash, MAX_BITS) {
                return b;
            }
            nonce += 1;
        }
    }

    #[test]
    fn test_accept_headers_from_genesis() {
        let g = mine(0, 1000, None);
        let b1 = mine(1, 1001, Some(g.hash.clone()));
        let b2 = mine(2, 1002, Some(b1.hash.clone()));

        let mut hc = HeaderChain::new();
        let n = hc.accept_headers(vec![g.header(), b1.header(), b2.header()]).unwrap();
        assert_eq!(n, 3);
        assert_eq!(hc.height(), 2);
    }

    #[test]
    fn test_incremental_append_skips_known_prefix() {
        let g = mine(0, 1000, None);
        let b1 = mine(1, 1001, Some(g.hash.clone()));

        let mut hc = HeaderChain::new();
        hc.accept_headers(vec![g.header()]).unwrap();
        // a full re-send only adds the new tail
        let n = hc.accept_headers(vec![g.header(), b1.header()]).unwrap();
        assert_eq!(n, 1);
        assert_eq!(hc.height(), 1);
    }

    #[test]
    fn test_rejects_disconnected_run() {
        let g = mine(0, 1000, None);
        let stranger = mine(1, 1001, Some("ab".repeat(32)));

        let mut hc = HeaderChain::new();
        hc.accept_headers(vec![g.header()]).unwrap();
        assert!(hc.accept_headers(vec![stranger.header()]).is_err());
        assert_eq!(hc.height(), 0);
    }

    #[test]
    fn test_inclusion_proof_against_header() {
        let ts = 1000u64;
        let cb = Transaction::coinbase("miner", 1, ts as f64);
        let entry = crate::primitives::DataEntry::new_at(
            "s".into(),
            "temp".into(),
            b"5".to_vec(),
            ts as f64,
            1,
            None,
            Default::default(),
        );
        let tx = Transaction::build(vec![entry], ts as f64, None, 0);

        let leaves = vec![cb.tx_hash.clone(), tx.tx_hash.clone()];
        let root = merkle::merkle_root(&leaves).unwrap();
        let g = mine(0, 999, None);
        let mut nonce = 0u64;
        let block = loop {
            let b = Block::sealed(
                1,
                ts,
                Some(g.hash.clone()),
                MAX_BITS.into(),
                root.clone(),
                vec![cb.clone(), tx.clone()],
                nonce,
                None,
            );
            if difficulty::hash_meets_target(&b.hash, MAX_BITS) {
                break b;
            }
            nonce += 1;
        };

        let mut hc = HeaderChain::new();
        hc.accept_headers(vec![g.header(), block.header()]).unwrap();

        // sibling of each leaf is the other leaf
        assert!(hc.verify_inclusion(&tx.tx_hash, &block.hash, &[cb.tx_hash.clone()]));
        assert!(hc.verify_inclusion(&cb.tx_hash, &block.hash, &[tx.tx_hash.clone()]));
        assert!(!hc.verify_inclusion(&"00".repeat(32), &block.hash, &[cb.tx_hash.clone()]));
    }
}
