// NodeContext: the shared state graph.
//
// Instead of managers holding back-references to a node object, every
// component takes an Arc<NodeContext> and reaches the chain, mempool, key
// directory and identity through it. Each field carries its own lock and
// no method holds two locks across a component boundary: the key
// directory is snapshotted before chain placement, and mempool updates
// happen after the chain lock is released.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{mpsc, Mutex, RwLock};

use crate::config::NodeConfig;
use crate::consensus::engine::{AddBlockResult, ChainManager};
use crate::consensus::validate;
use crate::crypto::keys::{KeyDirectory, KeyError};
use crate::net::mempool::{Mempool, MempoolAdd};
use crate::net::node::{P2pCommand, PeerInfo};
use crate::net::protocol::{Message, INV_TYPE_BLOCK, INV_TYPE_TX};
use crate::node::storage::ChainStore;
use crate::primitives::{Block, DataEntry, Transaction};
use crate::wallet::Wallet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Full,
    Miner,
    Gateway,
    Wallet,
    Spv,
}

impl NodeRole {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "FULL" => Some(NodeRole::Full),
            "MINER" => Some(NodeRole::Miner),
            "GATEWAY" => Some(NodeRole::Gateway),
            "WALLET" => Some(NodeRole::Wallet),
            "SPV" => Some(NodeRole::Spv),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Full => "FULL",
            NodeRole::Miner => "MINER",
            NodeRole::Gateway => "GATEWAY",
            NodeRole::Wallet => "WALLET",
            NodeRole::Spv => "SPV",
        }
    }

    /// Mining starts immediately for this role.
    pub fn mines(&self) -> bool {
        matches!(self, NodeRole::Miner)
    }

    /// A PoW worker exists for this role (gateways hold a paused worker
    /// that the mining-control endpoints can wake).
    pub fn can_mine(&self) -> bool {
        matches!(self, NodeRole::Miner | NodeRole::Gateway)
    }

    pub fn serves_http(&self) -> bool {
        matches!(self, NodeRole::Gateway | NodeRole::Wallet)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("transaction integrity check failed")]
    InvalidTransaction,
    #[error("transaction carries no signature")]
    MissingSignature,
    #[error("no registered key for signer {0}")]
    UnknownSigner(String),
    #[error("signature verification failed")]
    BadSignature,
    #[error("mempool is full")]
    MempoolFull,
    #[error("transaction already pending")]
    DuplicateTransaction,
}

pub struct NodeContext {
    pub config: NodeConfig,
    pub role: NodeRole,
    pub wallet: Wallet,
    pub chain: Mutex<ChainManager>,
    pub mempool: Mutex<Mempool>,
    pub key_directory: RwLock<KeyDirectory>,
    pub store: ChainStore,
    pub peers: Mutex<HashMap<SocketAddr, PeerInfo>>,
    pub p2p_tx: mpsc::UnboundedSender<P2pCommand>,
    /// bumped whenever the active tip changes; the miner drops stale work
    pub tip_generation: AtomicU64,
    pub miner_stop: AtomicBool,
    pub shutdown: AtomicBool,
    /// last data_hash per source, threaded into the next entry
    last_entry_hash: Mutex<HashMap<String, String>>,
}

impl NodeContext {
    pub fn bootstrap(
        config: NodeConfig,
        role: NodeRole,
        p2p_tx: mpsc::UnboundedSender<P2pCommand>,
    ) -> Result<Self, KeyError> {
        let wallet = Wallet::new(crate::crypto::keys::load_or_create_identity(&config.data_dir)?);
        let store = ChainStore::new(&config.data_dir);

        let mut chain = ChainManager::new();
        if let Some(persisted) = store.load() {
            eprintln!("[persist] restored chain of {} block(s)", persisted.len());
            chain.install_chain(persisted);
        }

        let mut directory = KeyDirectory::new();
        directory.register(wallet.address(), wallet.public_key());
        load_known_signers(&config.data_dir, &mut directory);

        Ok(NodeContext {
            config,
            role,
            wallet,
            chain: Mutex::new(chain),
            mempool: Mutex::new(Mempool::new()),
            key_directory: RwLock::new(directory),
            store,
            peers: Mutex::new(HashMap::new()),
            p2p_tx,
            tip_generation: AtomicU64::new(0),
            // anything but a MINER starts with its worker paused
            miner_stop: AtomicBool::new(!role.mines()),
            shutdown: AtomicBool::new(false),
            last_entry_hash: Mutex::new(HashMap::new()),
        })
    }

    pub async fn height(&self) -> i64 {
        self.chain.lock().await.height()
    }

    pub fn gossip(&self, msg: Message) {
        let _ = self.p2p_tx.send(P2pCommand::Broadcast(msg));
    }

    /// Run a block through consensus placement, then settle the fallout:
    /// mined transactions leave the mempool, transactions orphaned by a
    /// reorganization come back, the tip generation advances, the chain is
    /// snapshotted to disk, and each newly active block is announced.
    pub async fn accept_block(&self, block: Block) -> AddBlockResult {
        let keys_snapshot = self.key_directory.read().await.clone();
        let result = {
            let mut chain = self.chain.lock().await;
            chain.add_block(block, &keys_snapshot)
        };

        if !result.connected.is_empty() {
            {
                let mut pool = self.mempool.lock().await;
                for b in &result.connected {
                    pool.remove(&b.data);
                }
                for tx in &result.disconnected_txs {
                    let _ = pool.add(tx.clone());
                }
            }
            self.tip_generation.fetch_add(1, Ordering::SeqCst);
            self.persist().await;
            for b in &result.connected {
                self.gossip(Message::inv_single(INV_TYPE_BLOCK, b.hash.clone()));
            }
        }
        result
    }

    /// Validate a transaction (integrity, plus signature when present),
    /// pool it, and announce it.
    pub async fn accept_transaction(&self, tx: Transaction) -> Result<(), SubmitError> {
        if !validate::verify_transaction(&tx) {
            return Err(SubmitError::InvalidTransaction);
        }
        if let Some(signature) = &tx.signature {
            let signer = tx
                .entries
                .first()
                .map(|e| e.source_id.clone())
                .unwrap_or_default();
            let directory = self.key_directory.read().await;
            let key = directory
                .lookup(&signer)
                .ok_or(SubmitError::UnknownSigner(signer))?;
            if !validate::verify_transaction_signature(key, &tx.tx_hash, signature) {
                return Err(SubmitError::BadSignature);
            }
        }

        let added = self.mempool.lock().await.add(tx.clone());
        match added {
            MempoolAdd::Accepted => {
                self.gossip(Message::inv_single(INV_TYPE_TX, tx.tx_hash.clone()));
                Ok(())
            }
            MempoolAdd::Duplicate => Err(SubmitError::DuplicateTransaction),
            MempoolAdd::Full => Err(SubmitError::MempoolFull),
        }
    }

    /// Gateway contract: wrap external data in an entry bound to this
    /// node's address, sign the transaction, pool it, gossip it.
    pub async fn submit_external_data(
        &self,
        source_id: String,
        data_type: String,
        value: Vec<u8>,
        nonce: u64,
        mut metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<String, SubmitError> {
        let address = self.wallet.address();
        if source_id != address {
            metadata.insert("original_source".to_string(), serde_json::json!(source_id));
        }
        let previous = self.last_entry_hash.lock().await.get(&address).cloned();

        let entry = DataEntry::new(address.clone(), data_type, value, nonce, previous, metadata);
        let entry_hash = entry.data_hash.clone();
        let tx = self
            .wallet
            .create_and_sign(vec![entry], 0)
            .map_err(|_| SubmitError::BadSignature)?;

        self.accept_transaction(tx.clone()).await?;
        self.last_entry_hash
            .lock()
            .await
            .insert(address, entry_hash);
        Ok(tx.tx_hash)
    }

    /// Gateway contract for pre-signed submissions.
    pub async fn submit_signed_transaction(&self, tx: Transaction) -> Result<String, SubmitError> {
        if tx.signature.is_none() {
            return Err(SubmitError::MissingSignature);
        }
        self.accept_transaction(tx.clone()).await?;
        Ok(tx.tx_hash)
    }

    /// Final snapshot on shutdown, outcome logged only.
    pub async fn persist(&self) {
        let snapshot: Vec<Block> = self.chain.lock().await.chain().to_vec();
        let store = self.store.clone();
        let _ = tokio::task::spawn_blocking(move || store.save(&snapshot)).await;
    }
}

/// Optional `known_signers.json` in the data dir: `{address: pubkey_der_hex}`.
/// This is how the environment hands the node the keys of signers it
/// should accept besides its own.
fn load_known_signers(data_dir: &str, directory: &mut KeyDirectory) {
    let path = std::path::Path::new(data_dir).join("known_signers.json");
    let Ok(raw) = std::fs::read_to_string(&path) else { return };
    match serde_json::from_str::<HashMap<String, String>>(&raw) {
        Ok(entries) => {
            for (address, der_hex) in entries {
                match crate::crypto::keys::public_key_from_der_hex(&der_hex) {
                    Ok(key) => directory.register(address, key),
                    Err(_) => eprintln!("[init] skipping malformed key for {address}"),
                }
            }
            eprintln!("[init] signer directory holds {} key(s)", directory.len());
        }
        Err(e) => eprintln!("[init] known_signers.json unreadable: {e}"),
    }
}
