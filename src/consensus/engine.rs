// Chain manager: decides where a candidate block lands (extend main,
// install genesis, record a fork, hold as orphan), enforces contextual
// rules (retarget schedule, registered-signer signatures), and switches
// the active chain when a side branch outgrows it.
//
// All placement runs under the owner's single mutex; this type itself is
// plain data. Mempool updates are returned to the caller instead of being
// applied here so no two component locks are ever held at once.

use std::collections::{HashMap, HashSet};

use crate::config::DIFFICULTY_ADJUSTMENT_INTERVAL;
use crate::consensus::difficulty;
use crate::consensus::validate::{self, ValidationError};
use crate::crypto::keys::KeyDirectory;
use crate::primitives::{unix_now, Block, BlockHeader, Transaction};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RejectReason {
    #[error("invalid block: {0}")]
    Invalid(#[from] ValidationError),
    #[error("block already known")]
    DuplicateBlock,
    #[error("branch does not outgrow the active chain")]
    StaleFork,
    #[error("bits do not match the retarget schedule")]
    WrongDifficulty,
    #[error("signature rejected for transaction {0}")]
    BadSignature(String),
    #[error("no registered key for signer {0}")]
    UnknownSigner(String),
    #[error("genesis block malformed")]
    BadGenesis,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockOutcome {
    /// Part of the active chain (directly or via reorganization).
    Accepted,
    /// Held as an orphan until its parent shows up.
    Pending,
    Rejected(RejectReason),
}

/// What a call to `add_block` did beyond the outcome: which blocks joined
/// the active chain (the candidate, connected orphans, a reorg branch) and
/// which transactions fell out of it and belong back in the mempool.
#[derive(Debug)]
pub struct AddBlockResult {
    pub outcome: BlockOutcome,
    pub connected: Vec<Block>,
    pub disconnected_txs: Vec<Transaction>,
}

#[derive(Default)]
struct Effects {
    connected: Vec<Block>,
    disconnected_txs: Vec<Transaction>,
    /// hashes that just became known (main or side); drives orphan cascade
    newly_known: Vec<String>,
}

#[derive(Default)]
pub struct ChainManager {
    main: Vec<Block>,
    /// hash -> height, active chain only
    main_index: HashMap<String, u64>,
    /// known blocks off the active chain, by hash
    side: HashMap<String, Block>,
    /// structurally valid blocks waiting for their parent, by parent hash
    orphans: HashMap<String, Vec<Block>>,
}

impl ChainManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt an already-verified chain (persistence load).
    pub fn install_chain(&mut self, chain: Vec<Block>) {
        self.main_index = chain.iter().map(|b| (b.hash.clone(), b.index)).collect();
        self.main = chain;
        self.side.clear();
        self.orphans.clear();
    }

    /// Height of the active tip, -1 when the chain is empty.
    pub fn height(&self) -> i64 {
        self.main.last().map(|b| b.index as i64).unwrap_or(-1)
    }

    pub fn tip(&self) -> Option<&Block> {
        self.main.last()
    }

    pub fn chain(&self) -> &[Block] {
        &self.main
    }

    pub fn block_by_index(&self, index: u64) -> Option<&Block> {
        self.main.get(index as usize)
    }

    pub fn block_by_hash(&self, hash: &str) -> Option<&Block> {
        match self.main_index.get(hash) {
            Some(&h) => self.main.get(h as usize),
            None => self.side.get(hash),
        }
    }

    /// Known anywhere: active chain or side branches.
    pub fn have_block(&self, hash: &str) -> bool {
        self.main_index.contains_key(hash) || self.side.contains_key(hash)
    }

    pub fn side_len(&self) -> usize {
        self.side.len()
    }

    pub fn orphan_len(&self) -> usize {
        self.orphans.values().map(|v| v.len()).sum()
    }

    /// Trivial locator: the genesis hash.
    // TODO: switch to a Bitcoin-style exponential locator so deep forks
    // resolve without walking from genesis.
    pub fn locator(&self) -> Vec<String> {
        self.main.first().map(|b| vec![b.hash.clone()]).unwrap_or_default()
    }

    /// Headers strictly after `after_hash` (or from genesis when the hash
    /// is unknown), at most `max`.
    pub fn headers_after(&self, after_hash: &str, max: usize) -> Vec<BlockHeader> {
        let start = self
            .main_index
            .get(after_hash)
            .map(|&h| h as usize + 1)
            .unwrap_or(0);
        self.main.iter().skip(start).take(max).map(|b| b.header()).collect()
    }

    pub fn add_block(&mut self, block: Block, keys: &KeyDirectory) -> AddBlockResult {
        let mut fx = Effects::default();
        let outcome = self.place(block, keys, &mut fx);

        // connect any orphans whose parent just became known, cascading
        let mut cursor = 0;
        while cursor < fx.newly_known.len() {
            let parent = fx.newly_known[cursor].clone();
            cursor += 1;
            if let Some(children) = self.orphans.remove(&parent) {
                for child in children {
                    let _ = self.place(child, keys, &mut fx);
                }
            }
        }

        AddBlockResult {
            outcome,
            connected: fx.connected,
            disconnected_txs: fx.disconnected_txs,
        }
    }

    fn place(&mut self, block: Block, keys: &KeyDirectory, fx: &mut Effects) -> BlockOutcome {
        if let Err(e) = validate::verify_block(&block, unix_now()) {
            return BlockOutcome::Rejected(e.into());
        }
        if self.have_block(&block.hash) {
            return BlockOutcome::Rejected(RejectReason::DuplicateBlock);
        }

        if self.main.is_empty() {
            return if block.previous_hash.is_none() && block.index == 0 {
                self.push_main(block, fx);
                BlockOutcome::Accepted
            } else if block.previous_hash.is_some() {
                self.stash_orphan(block);
                BlockOutcome::Pending
            } else {
                // previous_hash absent at a nonzero height
                BlockOutcome::Rejected(RejectReason::BadGenesis)
            };
        }

        let tip_hash = self.main.last().map(|b| b.hash.clone()).unwrap_or_default();
        let tip_index = self.main.last().map(|b| b.index).unwrap_or(0);

        let Some(prev) = block.previous_hash.clone() else {
            // a competing genesis can never outgrow an installed one here
            return BlockOutcome::Rejected(RejectReason::StaleFork);
        };

        if prev == tip_hash && block.index == tip_index + 1 {
            if let Some(parent) = self.block_by_hash(&prev).cloned() {
                if let Err(reason) = self.contextual_checks(&block, &parent, keys) {
                    return BlockOutcome::Rejected(reason);
                }
            }
            self.push_main(block, fx);
            return BlockOutcome::Accepted;
        }

        if let Some(parent) = self.block_by_hash(&prev).cloned() {
            // fork off a known, non-tip block
            if block.index != parent.index + 1 {
                return BlockOutcome::Rejected(RejectReason::Invalid(
                    ValidationError::MalformedField("index does not follow parent"),
                ));
            }
            if let Err(reason) = self.contextual_checks(&block, &parent, keys) {
                return BlockOutcome::Rejected(reason);
            }
            let block_index = block.index;
            let block_hash = block.hash.clone();
            self.side.insert(block_hash.clone(), block);
            fx.newly_known.push(block_hash.clone());

            if block_index > tip_index {
                self.reorganize(&block_hash, fx);
                return BlockOutcome::Accepted;
            }
            return BlockOutcome::Rejected(RejectReason::StaleFork);
        }

        self.stash_orphan(block);
        BlockOutcome::Pending
    }

    /// Contextual rules against a concrete parent: the retarget schedule
    /// and signatures of registered signers.
    fn contextual_checks(
        &self,
        block: &Block,
        parent: &Block,
        keys: &KeyDirectory,
    ) -> Result<(), RejectReason> {
        if difficulty::should_adjust(block.index) {
            let anchor_index = block.index - DIFFICULTY_ADJUSTMENT_INTERVAL;
            let anchor = self
                .ancestor_at(parent, anchor_index)
                .ok_or(RejectReason::WrongDifficulty)?;
            let expected = difficulty::expected_bits(&anchor, parent)
                .map_err(|_| RejectReason::WrongDifficulty)?;
            if block.bits != expected {
                return Err(RejectReason::WrongDifficulty);
            }
        } else if block.bits != parent.bits {
            return Err(RejectReason::WrongDifficulty);
        }

        for tx in &block.data {
            if tx.is_coinbase() {
                continue;
            }
            let Some(signature) = &tx.signature else { continue };
            let signer = tx
                .entries
                .first()
                .map(|e| e.source_id.as_str())
                .unwrap_or_default();
            let key = keys
                .lookup(signer)
                .ok_or_else(|| RejectReason::UnknownSigner(signer.to_string()))?;
            if !validate::verify_transaction_signature(key, &tx.tx_hash, signature) {
                return Err(RejectReason::BadSignature(tx.tx_hash.clone()));
            }
        }
        Ok(())
    }

    /// Walk parent pointers (through main and side) down to `index`.
    fn ancestor_at(&self, from: &Block, index: u64) -> Option<Block> {
        let mut current = from.clone();
        while current.index > index {
            let prev = current.previous_hash.as_deref()?;
            current = self.block_by_hash(prev)?.clone();
        }
        (current.index == index).then_some(current)
    }

    fn push_main(&mut self, block: Block, fx: &mut Effects) {
        self.main_index.insert(block.hash.clone(), block.index);
        fx.newly_known.push(block.hash.clone());
        fx.connected.push(block.clone());
        self.main.push(block);
    }

    fn stash_orphan(&mut self, block: Block) {
        let parent = block.previous_hash.clone().unwrap_or_default();
        let bucket = self.orphans.entry(parent).or_default();
        if !bucket.iter().any(|b| b.hash == block.hash) {
            bucket.push(block);
        }
    }

    /// Switch the active chain to the branch ending at `new_tip_hash`.
    /// The branch is walked backward through `side` to its fork point in
    /// `main`; old main blocks above the fork point move to `side`.
    fn reorganize(&mut self, new_tip_hash: &str, fx: &mut Effects) {
        let mut branch: Vec<Block> = Vec::new();
        let mut cursor = match self.side.get(new_tip_hash) {
            Some(b) => b.clone(),
            None => return,
        };
        let ancestor_height = loop {
            let prev = cursor.previous_hash.clone();
            branch.push(cursor.clone());
            match prev.and_then(|p| {
                self.main_index
                    .get(&p)
                    .copied()
                    .map(Ok)
                    .or_else(|| self.side.get(&p).cloned().map(Err))
            }) {
                Some(Ok(height)) => break height,
                Some(Err(side_parent)) => cursor = side_parent,
                // branch does not reach the active chain; leave main alone
                None => return,
            }
        };

        let disconnected = self.main.split_off(ancestor_height as usize + 1);
        for b in &disconnected {
            self.main_index.remove(&b.hash);
            self.side.insert(b.hash.clone(), b.clone());
        }

        branch.reverse();
        let branch_tx_hashes: HashSet<String> = branch
            .iter()
            .flat_map(|b| b.data.iter().map(|tx| tx.tx_hash.clone()))
            .collect();
        for b in branch {
            self.side.remove(&b.hash);
            self.push_main(b, fx);
        }

        // transactions unique to the disconnected blocks go back to the
        // mempool so a reorganization cannot silently drop data
        for b in disconnected {
            for tx in b.data {
                if !tx.is_coinbase() && !branch_tx_hashes.contains(&tx.tx_hash) {
                    fx.disconnected_txs.push(tx);
                }
            }
        }

        let tip_short: String = new_tip_hash.chars().take(12).collect();
        eprintln!("[consensus] reorganized: new tip {tip_short} at height {}", self.height());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::difficulty::MAX_BITS;
    use crate::primitives::merkle;

    fn keys() -> KeyDirectory {
        KeyDirectory::new()
    }

    fn mine(index: u64, timestamp: u64, previous: Option<String>, bits: &str, txs: Vec<Transaction>) -> Block {
        let mut data = vec![Transaction::coinbase("miner-addr", index, timestamp as f64)];
        data.extend(txs);
        let hashes: Vec<String> = data.iter().map(|t| t.tx_hash.clone()).collect();
        let root = merkle::merkle_root(&hashes).unwrap();
        let mut nonce = 0u64;
        loop {
            let b = Block::sealed(
                index,
                timestamp,
                previous.clone(),
                bits.to_string(),
                root.clone(),
                data.clone(),
                nonce,
                None,
            );
            if difficulty::hash_meets_target(&b.hash, bits) {
                return b;
            }
            nonce += 1;
        }
    }

    fn genesis() -> Block {
        mine(0, unix_now() - 1000, None, MAX_BITS, vec![])
    }

    fn extend(parent: &Block, txs: Vec<Transaction>) -> Block {
        mine(
            parent.index + 1,
            parent.timestamp + 1,
            Some(parent.hash.clone()),
            MAX_BITS,
            txs,
        )
    }

    #[test]
    fn test_genesis_install() {
        let mut cm = ChainManager::new();
        let g = genesis();
        let res = cm.add_block(g, &keys());
        assert_eq!(res.outcome, BlockOutcome::Accepted);
        assert_eq!(cm.height(), 0);
        assert_eq!(cm.chain().len(), 1);
    }

    #[test]
    fn test_extend_and_duplicate() {
        let mut cm = ChainManager::new();
        let g = genesis();
        let b1 = extend(&g, vec![]);
        assert_eq!(cm.add_block(g, &keys()).outcome, BlockOutcome::Accepted);
        assert_eq!(cm.add_block(b1.clone(), &keys()).outcome, BlockOutcome::Accepted);
        assert_eq!(cm.height(), 1);
        assert_eq!(
            cm.add_block(b1, &keys()).outcome,
            BlockOutcome::Rejected(RejectReason::DuplicateBlock)
        );
    }

    #[test]
    fn test_wrong_bits_rejected() {
        let mut cm = ChainManager::new();
        let g = genesis();
        cm.add_block(g.clone(), &keys());
        // valid PoW but bits differ from the parent outside a retarget height
        let b1 = mine(1, g.timestamp + 1, Some(g.hash.clone()), "207ffffe", vec![]);
        assert_eq!(
            cm.add_block(b1, &keys()).outcome,
            BlockOutcome::Rejected(RejectReason::WrongDifficulty)
        );
    }

    #[test]
    fn test_orphan_then_connect() {
        let mut cm = ChainManager::new();
        let g = genesis();
        let b1 = extend(&g, vec![]);
        let b2 = extend(&b1, vec![]);

        // deliver out of order: child first
        assert_eq!(cm.add_block(b2.clone(), &keys()).outcome, BlockOutcome::Pending);
        assert_eq!(cm.orphan_len(), 1);
        assert_eq!(cm.add_block(b1.clone(), &keys()).outcome, BlockOutcome::Pending);
        assert_eq!(cm.orphan_len(), 2);

        let res = cm.add_block(g, &keys());
        assert_eq!(res.outcome, BlockOutcome::Accepted);
        // cascade connected everything in order
        assert_eq!(cm.height(), 2);
        assert_eq!(cm.orphan_len(), 0);
        let connected: Vec<u64> = res.connected.iter().map(|b| b.index).collect();
        assert_eq!(connected, vec![0, 1, 2]);
    }

    #[test]
    fn test_fork_resolution_longest_wins() {
        let mut cm = ChainManager::new();
        let g = genesis();
        cm.add_block(g.clone(), &keys());

        let a1 = extend(&g, vec![]);
        let a2 = extend(&a1, vec![]);
        let a3 = extend(&a2, vec![]);
        for b in [&a1, &a2, &a3] {
            assert_eq!(cm.add_block(b.clone(), &keys()).outcome, BlockOutcome::Accepted);
        }

        // competing branch from genesis, one longer; use later timestamps
        // so the branch blocks are distinct from a1..a3
        let b1 = mine(1, g.timestamp + 50, Some(g.hash.clone()), MAX_BITS, vec![]);
        let b2 = mine(2, b1.timestamp + 1, Some(b1.hash.clone()), MAX_BITS, vec![]);
        let b3 = mine(3, b2.timestamp + 1, Some(b2.hash.clone()), MAX_BITS, vec![]);
        let b4 = mine(4, b3.timestamp + 1, Some(b3.hash.clone()), MAX_BITS, vec![]);

        for b in [&b1, &b2, &b3] {
            assert_eq!(
                cm.add_block(b.clone(), &keys()).outcome,
                BlockOutcome::Rejected(RejectReason::StaleFork)
            );
        }
        let res = cm.add_block(b4.clone(), &keys());
        assert_eq!(res.outcome, BlockOutcome::Accepted);

        assert_eq!(cm.height(), 4);
        let tip_hashes: Vec<String> = cm.chain().iter().map(|b| b.hash.clone()).collect();
        assert_eq!(tip_hashes, vec![g.hash, b1.hash, b2.hash, b3.hash, b4.hash]);
        // a1..a3 retired to the side map
        assert_eq!(cm.side_len(), 3);
    }

    #[test]
    fn test_reorg_returns_disconnected_txs() {
        let mut cm = ChainManager::new();
        let g = genesis();
        cm.add_block(g.clone(), &keys());

        // unsigned data transaction mined only on the a-branch
        let entry = crate::primitives::DataEntry::new_at(
            "sensor-9".into(),
            "temp".into(),
            b"17".to_vec(),
            (g.timestamp + 1) as f64,
            1,
            None,
            Default::default(),
        );
        let tx = Transaction::build(vec![entry], (g.timestamp + 1) as f64, None, 0);
        let a1 = extend(&g, vec![tx.clone()]);
        cm.add_block(a1.clone(), &keys());

        let b1 = mine(1, g.timestamp + 60, Some(g.hash.clone()), MAX_BITS, vec![]);
        let b2 = mine(2, b1.timestamp + 1, Some(b1.hash.clone()), MAX_BITS, vec![]);
        cm.add_block(b1, &keys());
        let res = cm.add_block(b2, &keys());
        assert_eq!(res.outcome, BlockOutcome::Accepted);
        assert_eq!(cm.height(), 2);

        let returned: Vec<String> = res.disconnected_txs.iter().map(|t| t.tx_hash.clone()).collect();
        assert_eq!(returned, vec![tx.tx_hash]);
    }

    #[test]
    fn test_retarget_boundary_enforced() {
        let mut cm = ChainManager::new();
        let interval = DIFFICULTY_ADJUSTMENT_INTERVAL;

        // build a chain up to the block just before the retarget height
        let mut blocks = vec![mine(0, unix_now() - 10_000, None, MAX_BITS, vec![])];
        for i in 1..interval {
            let parent = blocks.last().unwrap().clone();
            blocks.push(mine(
                i,
                parent.timestamp + 1,
                Some(parent.hash.clone()),
                MAX_BITS,
                vec![],
            ));
        }
        for b in &blocks {
            assert_eq!(cm.add_block(b.clone(), &keys()).outcome, BlockOutcome::Accepted);
        }

        let parent = blocks.last().unwrap().clone();
        let anchor = blocks[0].clone();
        let expected = difficulty::expected_bits(&anchor, &parent).unwrap();

        // carrying the parent's bits across the boundary is wrong whenever
        // the schedule demands a change
        if expected != parent.bits {
            let wrong = mine(
                interval,
                parent.timestamp + 1,
                Some(parent.hash.clone()),
                &parent.bits,
                vec![],
            );
            assert_eq!(
                cm.add_block(wrong, &keys()).outcome,
                BlockOutcome::Rejected(RejectReason::WrongDifficulty)
            );
        }

        let right = mine(
            interval,
            parent.timestamp + 1,
            Some(parent.hash.clone()),
            &expected,
            vec![],
        );
        assert_eq!(cm.add_block(right, &keys()).outcome, BlockOutcome::Accepted);
    }

    #[test]
    fn test_signed_tx_requires_registered_key() {
        let mut cm = ChainManager::new();
        let g = genesis();
        cm.add_block(g.clone(), &keys());

        let pair = crate::crypto::keys::Keypair::generate();
        let entry = crate::primitives::DataEntry::new_at(
            pair.address(),
            "temp".into(),
            b"20".to_vec(),
            (g.timestamp + 1) as f64,
            1,
            None,
            Default::default(),
        );
        let tx = Transaction::build(vec![entry], (g.timestamp + 1) as f64, None, 0);
        let sig = pair.sign_hash(&tx.tx_hash).unwrap();
        let tx = tx.with_signature(sig);

        let b1 = extend(&g, vec![tx.clone()]);

        // signer unknown: rejected
        let res = cm.add_block(b1.clone(), &keys());
        assert!(matches!(
            res.outcome,
            BlockOutcome::Rejected(RejectReason::UnknownSigner(_))
        ));

        // signer registered: accepted
        let mut directory = KeyDirectory::new();
        directory.register(pair.address(), pair.public_key());
        assert_eq!(cm.add_block(b1, &directory).outcome, BlockOutcome::Accepted);
    }
}
