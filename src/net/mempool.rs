// Transaction Mempool
//
// In-memory pool of validated, unconfirmed transactions ordered by fee
// rate. No validation happens here; callers validate before insertion.
// When the pool is full new transactions are rejected, not evicted.

use std::collections::HashMap;

use crate::config::{MEMPOOL_EXPIRY_SEC, MEMPOOL_MAX_SIZE};
use crate::primitives::{unix_now_f64, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MempoolAdd {
    Accepted,
    Duplicate,
    Full,
}

#[derive(Debug, Clone)]
struct MempoolEntry {
    tx: Transaction,
    arrival: f64,
    /// insertion order, the stable tie-break for equal fee rates
    seq: u64,
}

#[derive(Default)]
pub struct Mempool {
    entries: HashMap<String, MempoolEntry>,
    next_seq: u64,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, tx: Transaction) -> MempoolAdd {
        if self.entries.contains_key(&tx.tx_hash) {
            return MempoolAdd::Duplicate;
        }
        if self.entries.len() >= MEMPOOL_MAX_SIZE {
            return MempoolAdd::Full;
        }
        let entry = MempoolEntry {
            arrival: unix_now_f64(),
            seq: self.next_seq,
            tx,
        };
        self.next_seq += 1;
        self.entries.insert(entry.tx.tx_hash.clone(), entry);
        MempoolAdd::Accepted
    }

    /// Top `max_count` transactions by fee rate, descending; ties resolve
    /// by arrival order.
    pub fn select(&self, max_count: usize) -> Vec<Transaction> {
        let mut entries: Vec<&MempoolEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| {
            b.tx
                .fee_rate
                .partial_cmp(&a.tx.fee_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.seq.cmp(&b.seq))
        });
        entries.into_iter().take(max_count).map(|e| e.tx.clone()).collect()
    }

    /// Drop transactions that were mined into an accepted block.
    pub fn remove(&mut self, mined: &[Transaction]) {
        for tx in mined {
            self.entries.remove(&tx.tx_hash);
        }
    }

    pub fn prune_expired(&mut self) -> usize {
        self.prune_expired_at(unix_now_f64())
    }

    pub fn prune_expired_at(&mut self, now: f64) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| now - e.arrival > MEMPOOL_EXPIRY_SEC as f64)
            .map(|(h, _)| h.clone())
            .collect();
        for h in &expired {
            self.entries.remove(h);
        }
        if !expired.is_empty() {
            eprintln!("[mempool] pruned {} expired transaction(s)", expired.len());
        }
        expired.len()
    }

    pub fn contains(&self, tx_hash: &str) -> bool {
        self.entries.contains_key(tx_hash)
    }

    pub fn get(&self, tx_hash: &str) -> Option<Transaction> {
        self.entries.get(tx_hash).map(|e| e.tx.clone())
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }
}
