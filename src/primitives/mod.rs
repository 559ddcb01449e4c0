pub mod block;
pub mod entry;
pub mod merkle;
pub mod transaction;

pub use block::{Block, BlockHeader};
pub use entry::DataEntry;
pub use transaction::Transaction;

/// Current Unix time in whole seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current Unix time with sub-second precision.
pub fn unix_now_f64() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
