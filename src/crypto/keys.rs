// Node identity: ECDSA keys over NIST P-256 and address derivation.
//
// Addresses follow the Bitcoin P2PKH recipe over the DER-encoded public
// key: Base58Check(0x00 || RIPEMD160(SHA256(pubkey_der))). Signing is
// RFC 6979 deterministic, so signatures are reproducible per (key, hash).

use std::path::{Path, PathBuf};

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use ripemd::{Digest, Ripemd160};

use crate::crypto::hash::{double_sha256, sha256};

const ADDRESS_VERSION_BYTE: u8 = 0x00;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid private key bytes")]
    InvalidPrivateKey,
    #[error("invalid public key encoding")]
    InvalidPublicKey,
    #[error("invalid signature encoding")]
    InvalidSignature,
    #[error("key file i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("key file malformed: {0}")]
    Malformed(String),
}

/// A node's signing identity: keypair plus the derived address.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
    verifying: VerifyingKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing = SigningKey::random(&mut rand::rngs::OsRng);
        let verifying = *signing.verifying_key();
        Keypair { signing, verifying }
    }

    pub fn from_private_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let signing = SigningKey::from_slice(bytes).map_err(|_| KeyError::InvalidPrivateKey)?;
        let verifying = *signing.verifying_key();
        Ok(Keypair { signing, verifying })
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.verifying
    }

    pub fn address(&self) -> String {
        derive_address(&self.verifying)
    }

    /// Sign a 64-char hex transaction hash. The raw 32 digest bytes are the
    /// message; ECDSA hashes them once more with SHA-256 internally.
    pub fn sign_hash(&self, tx_hash_hex: &str) -> Result<String, KeyError> {
        let msg = hex::decode(tx_hash_hex).map_err(|_| KeyError::InvalidSignature)?;
        let sig: Signature = self.signing.sign(&msg);
        Ok(hex::encode(sig.to_bytes()))
    }

    fn private_bytes(&self) -> Vec<u8> {
        self.signing.to_bytes().to_vec()
    }
}

/// Verify a hex signature over a hex transaction hash.
pub fn verify_signature(public_key: &VerifyingKey, tx_hash_hex: &str, signature_hex: &str) -> bool {
    let msg = match hex::decode(tx_hash_hex) {
        Ok(m) => m,
        Err(_) => return false,
    };
    let raw = match hex::decode(signature_hex) {
        Ok(r) => r,
        Err(_) => return false,
    };
    let sig = match Signature::from_slice(&raw) {
        Ok(s) => s,
        Err(_) => return false,
    };
    public_key.verify(&msg, &sig).is_ok()
}

/// Base58Check(version || RIPEMD160(SHA256(pubkey_DER)))
pub fn derive_address(public_key: &VerifyingKey) -> String {
    let der = public_key
        .to_public_key_der()
        .expect("P-256 keys always encode to DER");
    let sha = sha256(der.as_bytes());
    let mut ripemd = Ripemd160::new();
    ripemd.update(sha);
    let hash160 = ripemd.finalize();

    let mut payload = Vec::with_capacity(25);
    payload.push(ADDRESS_VERSION_BYTE);
    payload.extend_from_slice(&hash160);
    let checksum = double_sha256(&payload);
    payload.extend_from_slice(&checksum[..4]);

    bs58::encode(payload).into_string()
}

/// Validates Base58Check structure and checksum of an address string.
pub fn address_is_valid(address: &str) -> bool {
    let raw = match bs58::decode(address).into_vec() {
        Ok(r) => r,
        Err(_) => return false,
    };
    if raw.len() != 25 {
        return false;
    }
    let (payload, checksum) = raw.split_at(21);
    double_sha256(payload)[..4] == checksum[..]
}

pub fn public_key_to_der_hex(public_key: &VerifyingKey) -> String {
    let der = public_key
        .to_public_key_der()
        .expect("P-256 keys always encode to DER");
    hex::encode(der.as_bytes())
}

pub fn public_key_from_der_hex(der_hex: &str) -> Result<VerifyingKey, KeyError> {
    let der = hex::decode(der_hex).map_err(|_| KeyError::InvalidPublicKey)?;
    VerifyingKey::from_public_key_der(&der).map_err(|_| KeyError::InvalidPublicKey)
}

/// Directory of known signer keys, keyed by address. Populated by the
/// environment (the node registers its own identity at startup); consulted
/// by the consensus engine and the gateway for signature checks.
#[derive(Clone, Default)]
pub struct KeyDirectory {
    keys: std::collections::HashMap<String, VerifyingKey>,
}

impl KeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, address: String, key: VerifyingKey) {
        self.keys.insert(address, key);
    }

    pub fn lookup(&self, address: &str) -> Option<&VerifyingKey> {
        self.keys.get(address)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct StoredIdentity {
    private_key_hex: String,
    public_key_der_hex: String,
    address: String,
}

fn identity_file(data_dir: &str) -> PathBuf {
    Path::new(data_dir).join("identity.json")
}

/// Load the node identity from `<data_dir>/identity.json`, generating and
/// persisting a fresh keypair on first start.
pub fn load_or_create_identity(data_dir: &str) -> Result<Keypair, KeyError> {
    let path = identity_file(data_dir);
    if path.exists() {
        let raw = std::fs::read_to_string(&path)?;
        let stored: StoredIdentity =
            serde_json::from_str(&raw).map_err(|e| KeyError::Malformed(e.to_string()))?;
        let sk = hex::decode(&stored.private_key_hex)
            .map_err(|e| KeyError::Malformed(e.to_string()))?;
        let pair = Keypair::from_private_bytes(&sk)?;
        if pair.address() != stored.address {
            return Err(KeyError::Malformed(
                "stored address does not match private key".to_string(),
            ));
        }
        return Ok(pair);
    }

    let pair = Keypair::generate();
    std::fs::create_dir_all(data_dir)?;
    let stored = StoredIdentity {
        private_key_hex: hex::encode(pair.private_bytes()),
        public_key_der_hex: public_key_to_der_hex(&pair.public_key()),
        address: pair.address(),
    };
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(&stored).unwrap_or_default())?;
    std::fs::rename(&tmp, &path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = std::fs::metadata(&path) {
            let mut perms = meta.permissions();
            perms.set_mode(0o600);
            let _ = std::fs::set_permissions(&path, perms);
        }
    }

    Ok(pair)
}
