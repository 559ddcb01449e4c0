pub mod miner;

pub use miner::{build_template, mine, next_bits, spawn_worker, tip_snapshot, BlockTemplate, MineError, TipSnapshot};
