// Wallet: the node's authorship role. Owns the signing identity and turns
// data entries into signed transactions. Key material never leaves this
// type; callers hand over entries and get a sealed transaction back.

use crate::crypto::keys::{KeyError, Keypair};
use crate::primitives::{unix_now_f64, DataEntry, Transaction};

pub struct Wallet {
    keypair: Keypair,
}

impl Wallet {
    pub fn new(keypair: Keypair) -> Self {
        Wallet { keypair }
    }

    pub fn address(&self) -> String {
        self.keypair.address()
    }

    pub fn public_key(&self) -> p256::ecdsa::VerifyingKey {
        self.keypair.public_key()
    }

    pub fn sign_hash(&self, tx_hash_hex: &str) -> Result<String, KeyError> {
        self.keypair.sign_hash(tx_hash_hex)
    }

    /// Bundle entries into a transaction and sign its hash. The signature
    /// sits outside the hashed fields, so signing cannot shift the hash.
    pub fn create_and_sign(&self, entries: Vec<DataEntry>, fee: u64) -> Result<Transaction, KeyError> {
        let tx = Transaction::build(entries, unix_now_f64(), None, fee);
        let signature = self.keypair.sign_hash(&tx.tx_hash)?;
        Ok(tx.with_signature(signature))
    }
}
