//! Cryptographic primitives for MeshForge.
//!
//! Transaction authorization uses **Ed25519** signatures over the unsigned
//! transaction id; header hashing lives in `pow`.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::core::types::{Hash256, UnsignedTx};

/// Holds an Ed25519 signing key and its verifying key.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Self { signing_key, verifying_key }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        let verifying_key = signing_key.verifying_key();
        Self { signing_key, verifying_key }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// The lockup hash outputs paying this key carry
    pub fn lockup_hash(&self) -> Hash256 {
        pubkey_bytes_to_hash(&self.public_key_bytes())
    }

    /// Sign an arbitrary byte string.
    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        self.signing_key.sign(msg).to_bytes()
    }

    /// Sign the id of an unsigned transaction body.
    pub fn sign_tx(&self, unsigned: &UnsignedTx) -> [u8; 64] {
        self.sign(&unsigned.hash())
    }
}

/// Verify an Ed25519 signature. Expects a 32-byte pubkey and a 64-byte signature.
pub fn verify_signature(pubkey: &[u8], msg: &[u8], signature: &[u8]) -> bool {
    if pubkey.len() != 32 || signature.len() != 64 {
        return false;
    }

    let Ok(vk) = VerifyingKey::from_bytes(pubkey.try_into().unwrap()) else {
        return false;
    };

    let sig = Signature::from_bytes(signature.try_into().unwrap());
    vk.verify(msg, &sig).is_ok()
}

/// Deterministic pubkey hash stored in `LockupScript::P2pkh`.
///
/// Note: this is **not** Bitcoin's HASH160; it is double-SHA256(pubkey).
pub fn pubkey_bytes_to_hash(pubkey: &[u8]) -> Hash256 {
    double_sha256(pubkey)
}

pub fn double_sha256(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(&first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}
