// SPDX-License-Identifier: MIT OR Apache-2.0
//! Key policy for metadata path encryption.
//!
//! A 256-bit root key is persisted once (host seal-wrapped) and never leaves
//! storage unwrapped; per-purpose keys are derived from it with HKDF-SHA256
//! domain separation. Path components are encrypted convergently: the nonce
//! is an HMAC of the plaintext, so equal components always produce equal
//! ciphertexts and lookups can recompute the exact storage path a write used.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use prost::Message;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::storage::{Storage, StorageEntry};
use crate::types::{timestamp_now, PolicyRecord};
use crate::{Error, Result};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Convergent AES-256-GCM policy over metadata path components.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyPolicy {
    aes_key: [u8; KEY_LEN],
    nonce_key: [u8; KEY_LEN],
}

impl KeyPolicy {
    /// Load the persisted policy from `location`, rotating a fresh root key
    /// into place if none exists yet.
    pub fn load_or_rotate(storage: &dyn Storage, location: &str) -> Result<Self> {
        if let Some(entry) = storage.get(location)? {
            let record = PolicyRecord::decode(entry.value.as_slice())
                .map_err(|_| Error::Corrupted("key policy"))?;
            if record.key.len() != KEY_LEN {
                return Err(Error::Corrupted("key policy"));
            }
            let mut root = [0u8; KEY_LEN];
            root.copy_from_slice(&record.key);
            let policy = Self::from_root(&root);
            root.zeroize();
            return Ok(policy);
        }

        let mut root = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut root);

        let record = PolicyRecord {
            name: "metadata".to_string(),
            key: root.to_vec(),
            created_time: Some(timestamp_now()),
        };
        storage.put(StorageEntry::new(location, record.encode_to_vec()))?;

        let policy = Self::from_root(&root);
        root.zeroize();
        Ok(policy)
    }

    /// Derive the per-purpose keys from the root with domain separation.
    /// Each domain yields a cryptographically independent key.
    fn from_root(root: &[u8; KEY_LEN]) -> Self {
        Self {
            aes_key: derive_subkey(root, b"metadata path component encryption v1"),
            nonce_key: derive_subkey(root, b"metadata path component nonce v1"),
        }
    }

    /// Encrypt one path component. Deterministic: the nonce is derived from
    /// the plaintext, so equal inputs map to equal outputs. The result is
    /// URL-safe base64 and never contains `/`.
    pub fn encrypt_component(&self, plaintext: &str) -> Result<String> {
        let nonce_bytes = self.component_nonce(plaintext.as_bytes());
        let nonce = Nonce::from_slice(&nonce_bytes);

        let cipher = Aes256Gcm::new_from_slice(&self.aes_key)
            .map_err(|e| Error::Crypto(format!("invalid policy key: {e}")))?;
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| Error::Crypto(format!("component encryption failed: {e}")))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend(ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(combined))
    }

    /// Decrypt one encoded path component back to its plaintext name.
    pub fn decrypt_component(&self, encoded: &str) -> Result<String> {
        let combined = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| Error::Crypto(format!("component decode failed: {e}")))?;
        if combined.len() < NONCE_LEN {
            return Err(Error::Crypto("component too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);

        let cipher = Aes256Gcm::new_from_slice(&self.aes_key)
            .map_err(|e| Error::Crypto(format!("invalid policy key: {e}")))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| Error::Crypto(format!("component decryption failed: {e}")))?;

        String::from_utf8(plaintext)
            .map_err(|e| Error::Crypto(format!("component not utf-8: {e}")))
    }

    fn component_nonce(&self, plaintext: &[u8]) -> [u8; NONCE_LEN] {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.nonce_key)
            .expect("HMAC accepts any key length");
        mac.update(plaintext);
        let digest = mac.finalize().into_bytes();

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&digest[..NONCE_LEN]);
        nonce
    }
}

fn derive_subkey(root: &[u8; KEY_LEN], domain: &[u8]) -> [u8; KEY_LEN] {
    let hk = Hkdf::<Sha256>::new(None, root);
    let mut output = [0u8; KEY_LEN];
    hk.expand(domain, &mut output)
        .expect("HKDF expand never fails for 32-byte output");
    output
}
