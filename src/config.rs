/// Standard Protocol Ports
pub const DEFAULT_P2P_PORT: u16 = 8000;
pub const DEFAULT_GATEWAY_PORT: u16 = 8080;

/// Wire protocol version announced in `version` messages
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum P2P payload size accepted before allocation (2 MB, anti-DoS)
pub const NETWORK_MAX_PAYLOAD_SIZE: usize = 2 * 1024 * 1024;

/// Seconds to wait after binding before dialing seed peers
pub const NETWORK_STARTUP_DELAY_SEC: u64 = 2;

/// Target seconds between blocks
pub const BLOCK_TIME_TARGET_SEC: u64 = 60;

/// Blocks between difficulty retargets
pub const DIFFICULTY_ADJUSTMENT_INTERVAL: u64 = 10;

/// Damping factor for retargets: actual timespan is clamped to
/// [expected / CLAMP, expected * CLAMP]
pub const DIFFICULTY_CLAMP_FACTOR: u64 = 4;

/// Maximum seconds a block timestamp may sit ahead of local time (2 hours)
pub const BLOCK_MAX_FUTURE_TIME_SEC: u64 = 7200;

/// Mempool retention (14 days) and size ceiling
pub const MEMPOOL_EXPIRY_SEC: u64 = 14 * 24 * 60 * 60;
pub const MEMPOOL_MAX_SIZE: usize = 50_000;

/// Nonce search gives up after this many attempts (2^32 - 1)
pub const MAX_NONCE: u64 = 4_294_967_295;

/// Non-coinbase transactions per block template
pub const BLOCK_MAX_TXS: usize = 10;

/// Bind address for the P2P listener
pub const P2P_BIND_ADDRESS: &str = "0.0.0.0";

/// Data directory name under $HOME
pub const DATA_DIR: &str = ".meshledger";

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub p2p_port: u16,
    pub gateway_port: u16,
    pub data_dir: String,
}

impl NodeConfig {
    pub fn with_port(p2p_port: u16) -> Self {
        NodeConfig {
            p2p_port,
            gateway_port: gateway_port_env(),
            data_dir: default_data_dir(p2p_port),
        }
    }
}

fn gateway_port_env() -> u16 {
    std::env::var("MESHLEDGER_GATEWAY_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_GATEWAY_PORT)
}

// One data dir per port so several nodes can share a host during testing.
pub fn default_data_dir(port: u16) -> String {
    if let Ok(d) = std::env::var("MESHLEDGER_DATA_DIR") {
        if !d.trim().is_empty() {
            return d;
        }
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/{DATA_DIR}/node_{port}")
}
