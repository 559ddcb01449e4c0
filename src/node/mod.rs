pub mod context;
pub mod storage;

pub use context::{NodeContext, NodeRole};
pub use storage::ChainStore;
