// Mining: assemble a template against the current tip, pack the 92-byte
// header once, then walk nonces rewriting only the trailing 8 bytes.
//
// The worker is a dedicated OS thread (PoW never yields cooperatively).
// Cancellation is polled between nonce batches: shutdown, an explicit stop
// flag, or the tip generation moving on all abort the current search. A
// solution found against a stale tip is discarded at submission.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use primitive_types::U256;

use crate::config::{BLOCK_MAX_TXS, DIFFICULTY_ADJUSTMENT_INTERVAL, MAX_NONCE};
use crate::consensus::difficulty::{self, MAX_BITS};
use crate::consensus::engine::{BlockOutcome, ChainManager};
use crate::crypto::hash::double_sha256;
use crate::net::mempool::Mempool;
use crate::node::context::NodeContext;
use crate::primitives::block::pack_header;
use crate::primitives::{merkle, unix_now, unix_now_f64, Block, Transaction};

const CANCEL_POLL_INTERVAL: u64 = 1024;
const IDLE_WAIT_MS: u64 = 1000;

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum MineError {
    #[error("nonce space exhausted")]
    NonceExhausted,
    #[error("mining cancelled")]
    Cancelled,
    #[error("unusable block template: {0}")]
    Template(&'static str),
}

#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub index: u64,
    pub previous_hash: Option<String>,
    pub bits: String,
    /// floor for the fixed template timestamp (parent timestamp + 1)
    pub min_timestamp: u64,
    pub transactions: Vec<Transaction>,
}

/// Bits for the block after the current tip: copied from the parent unless
/// the next height triggers a retarget.
pub fn next_bits(chain: &ChainManager) -> String {
    let Some(parent) = chain.tip() else {
        return MAX_BITS.to_string();
    };
    let next_index = parent.index + 1;
    if difficulty::should_adjust(next_index) {
        if let Some(anchor) = chain.block_by_index(next_index - DIFFICULTY_ADJUSTMENT_INTERVAL) {
            if let Ok(bits) = difficulty::expected_bits(anchor, parent) {
                return bits;
            }
        }
    }
    parent.bits.clone()
}

/// Everything the template needs from the chain, captured under one short
/// lock so the mempool lock is never held at the same time.
#[derive(Debug, Clone)]
pub struct TipSnapshot {
    pub index: u64,
    pub previous_hash: Option<String>,
    pub min_timestamp: u64,
    pub bits: String,
}

pub fn tip_snapshot(chain: &ChainManager) -> TipSnapshot {
    match chain.tip() {
        Some(tip) => TipSnapshot {
            index: tip.index + 1,
            previous_hash: Some(tip.hash.clone()),
            min_timestamp: tip.timestamp + 1,
            bits: next_bits(chain),
        },
        None => TipSnapshot {
            index: 0,
            previous_hash: None,
            min_timestamp: 0,
            bits: MAX_BITS.to_string(),
        },
    }
}

/// Candidate assembly: coinbase paying the miner, then the top-fee-rate
/// mempool transactions up to the per-block cap.
pub fn build_template(tip: TipSnapshot, pool: &Mempool, miner_address: &str) -> BlockTemplate {
    let mut transactions = vec![Transaction::coinbase(miner_address, tip.index, unix_now_f64())];
    transactions.extend(pool.select(BLOCK_MAX_TXS));
    BlockTemplate {
        index: tip.index,
        previous_hash: tip.previous_hash,
        bits: tip.bits,
        min_timestamp: tip.min_timestamp,
        transactions,
    }
}

/// Nonce search. The timestamp is fixed when the search starts; the first
/// nonce whose header hash meets the target seals the block.
pub fn mine(template: &BlockTemplate, cancel: &dyn Fn() -> bool) -> Result<Block, MineError> {
    let timestamp = unix_now().max(template.min_timestamp);
    let tx_hashes: Vec<String> = template.transactions.iter().map(|t| t.tx_hash.clone()).collect();
    let root = merkle::merkle_root(&tx_hashes).map_err(|_| MineError::Template("merkle root"))?;
    let target = difficulty::bits_to_target(&template.bits).map_err(|_| MineError::Template("bits"))?;

    let mut header = pack_header(
        template.index,
        timestamp,
        template.previous_hash.as_deref(),
        &template.bits,
        &root,
        0,
    );

    let started = Instant::now();
    let mut nonce: u64 = 0;
    loop {
        header[84..92].copy_from_slice(&nonce.to_le_bytes());
        let digest = double_sha256(&header);
        if U256::from_big_endian(&digest) <= target {
            return Ok(Block::sealed(
                template.index,
                timestamp,
                template.previous_hash.clone(),
                template.bits.clone(),
                root,
                template.transactions.clone(),
                nonce,
                Some(started.elapsed().as_secs_f64()),
            ));
        }
        if nonce >= MAX_NONCE {
            return Err(MineError::NonceExhausted);
        }
        nonce += 1;
        if nonce % CANCEL_POLL_INTERVAL == 0 && cancel() {
            return Err(MineError::Cancelled);
        }
    }
}

/// The PoW worker thread. Parallel to the async runtime; submits solved
/// blocks back through the context (which gossips them).
pub fn spawn_worker(ctx: Arc<NodeContext>, rt: tokio::runtime::Handle) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("pow-worker".to_string())
        .spawn(move || worker_loop(ctx, rt))
        .expect("OS refused to spawn the mining thread")
}

fn worker_loop(ctx: Arc<NodeContext>, rt: tokio::runtime::Handle) {
    eprintln!("[miner] worker up, coinbase pays {}", ctx.wallet.address());

    loop {
        if ctx.shutdown.load(Ordering::SeqCst) {
            break;
        }
        // paused via the gateway's mining control; stay alive
        if ctx.miner_stop.load(Ordering::SeqCst) {
            std::thread::sleep(std::time::Duration::from_millis(IDLE_WAIT_MS));
            continue;
        }

        let generation = ctx.tip_generation.load(Ordering::SeqCst);
        let have_tip = { ctx.chain.blocking_lock().tip().is_some() };
        let pool_size = { ctx.mempool.blocking_lock().size() };

        // bootstrap an empty chain; otherwise idle until there is work
        if have_tip && pool_size == 0 {
            std::thread::sleep(std::time::Duration::from_millis(IDLE_WAIT_MS));
            continue;
        }

        let tip = tip_snapshot(&ctx.chain.blocking_lock());
        let template = build_template(
            tip,
            &ctx.mempool.blocking_lock(),
            &ctx.wallet.address(),
        );

        let cancel = || {
            ctx.shutdown.load(Ordering::SeqCst)
                || ctx.miner_stop.load(Ordering::SeqCst)
                || ctx.tip_generation.load(Ordering::SeqCst) != generation
        };

        match mine(&template, &cancel) {
            Ok(block) => {
                if ctx.tip_generation.load(Ordering::SeqCst) != generation {
                    // the tip moved while we searched; this solution is stale
                    continue;
                }
                let index = block.index;
                let took = block.mining_time.unwrap_or(0.0);
                let result = rt.block_on(ctx.accept_block(block));
                match result.outcome {
                    BlockOutcome::Accepted => {
                        eprintln!("[miner] sealed block {index} in {took:.2}s");
                    }
                    other => {
                        eprintln!("[miner] local block {index} not accepted: {other:?}");
                    }
                }
            }
            Err(MineError::Cancelled) => continue,
            Err(MineError::NonceExhausted) => {
                // rebuild with a fresh timestamp and mempool view
                eprintln!("[miner] nonce space exhausted at height {}, rebuilding", template.index);
            }
            Err(MineError::Template(what)) => {
                eprintln!("[miner] bad template ({what}), backing off");
                std::thread::sleep(std::time::Duration::from_millis(IDLE_WAIT_MS));
            }
        }
    }
    eprintln!("[miner] worker stopped");
}
