use std::fs;
use std::path::Path;

use blake2::{Blake2s256, Digest};
use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signature, Signer, Verifier};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredKeypair {
    pub public_key: String,
    pub secret_key: String,
}

pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    Blake2s256::digest(data).into()
}

pub fn hash_hex(data: &[u8]) -> String {
    hex::encode(hash_bytes(data))
}

pub fn generate_keypair() -> Keypair {
    Keypair::generate(&mut OsRng)
}

pub fn load_or_generate_keypair(path: &Path) -> ChainResult<Keypair> {
    if path.exists() {
        load_keypair(path)
    } else {
        let keypair = generate_keypair();
        save_keypair(path, &keypair)?;
        Ok(keypair)
    }
}

pub fn save_keypair(path: &Path, keypair: &Keypair) -> ChainResult<()> {
    let stored = StoredKeypair {
        public_key: hex::encode(keypair.public.to_bytes()),
        secret_key: hex::encode(keypair.secret.to_bytes()),
    };
    let encoded = toml::to_string_pretty(&stored)
        .map_err(|err| ChainError::Config(format!("failed to encode keypair: {err}")))?;
    fs::create_dir_all(path.parent().unwrap_or_else(|| Path::new(".")))?;
    fs::write(path, encoded)?;
    Ok(())
}

pub fn load_keypair(path: &Path) -> ChainResult<Keypair> {
    let raw = fs::read_to_string(path)?;
    let stored: StoredKeypair = toml::from_str(&raw)
        .map_err(|err| ChainError::Config(format!("failed to decode keypair: {err}")))?;
    let secret_bytes = hex::decode(stored.secret_key)
        .map_err(|err| ChainError::Config(format!("invalid secret key encoding: {err}")))?;
    let secret = SecretKey::from_bytes(&secret_bytes)
        .map_err(|err| ChainError::Config(format!("invalid secret key bytes: {err}")))?;
    let public = PublicKey::from(&secret);
    if hex::encode(public.to_bytes()) != stored.public_key {
        return Err(ChainError::Config(
            "stored public key does not match secret key".into(),
        ));
    }
    Ok(Keypair { secret, public })
}

pub fn public_key_from_hex(data: &str) -> ChainResult<PublicKey> {
    let bytes = hex::decode(data)
        .map_err(|err| ChainError::Crypto(format!("invalid public key encoding: {err}")))?;
    PublicKey::from_bytes(&bytes)
        .map_err(|err| ChainError::Crypto(format!("invalid public key bytes: {err}")))
}

pub fn signature_from_hex(data: &str) -> ChainResult<Signature> {
    let bytes = hex::decode(data)
        .map_err(|err| ChainError::Crypto(format!("invalid signature encoding: {err}")))?;
    Signature::try_from(bytes.as_slice())
        .map_err(|err| ChainError::Crypto(format!("invalid signature bytes: {err}")))
}

/// Derives the short account address shown to users from a hex public key.
pub fn address_from_public_key(public_key: &str) -> ChainResult<String> {
    let key = public_key_from_hex(public_key)?;
    Ok(hash_hex(key.as_bytes()))
}

/// Signing capability of a node or client.
///
/// Accounts on chain are identified by the hex encoded Ed25519 public key;
/// signatures are hex encoded as well so that they can live inside the JSON
/// payloads they cover.
pub struct Wallet {
    keypair: Keypair,
}

impl Wallet {
    pub fn new(keypair: Keypair) -> Self {
        Self { keypair }
    }

    pub fn generate() -> Self {
        Self::new(generate_keypair())
    }

    pub fn public_key_string(&self) -> String {
        hex::encode(self.keypair.public.to_bytes())
    }

    pub fn address(&self) -> String {
        hash_hex(self.keypair.public.as_bytes())
    }

    pub fn sign(&self, payload: &[u8]) -> String {
        hex::encode(self.keypair.sign(payload).to_bytes())
    }

    pub fn verify(payload: &[u8], signature: &str, public_key: &str) -> ChainResult<()> {
        let key = public_key_from_hex(public_key)?;
        let signature = signature_from_hex(signature)?;
        key.verify(payload, &signature)
            .map_err(|err| ChainError::Crypto(format!("signature verification failed: {err}")))
    }

    pub fn signature_valid(payload: &[u8], signature: &str, public_key: &str) -> bool {
        Self::verify(payload, signature, public_key).is_ok()
    }
}
