// SPDX-License-Identifier: MIT OR Apache-2.0
//! Persistent salt for version payload path derivation.
//!
//! A 256-bit secret stored raw at `<prefix>/salt` (host seal-wrapped).
//! Generated on first access and reused for the lifetime of the mount so
//! derived paths stay stable across restarts.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::storage::{Storage, StorageEntry};
use crate::{Error, Result};

/// Salt length in bytes.
pub const SALT_LEN: usize = 32;

/// Storage location suffix under the backend prefix.
pub(crate) const SALT_LOCATION: &str = "salt";

/// Persistent path-derivation secret (zeroized on drop).
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Salt {
    bytes: [u8; SALT_LEN],
}

impl Salt {
    /// Load the salt from `location`, generating and persisting a fresh one
    /// if none exists yet.
    pub fn load_or_generate(storage: &dyn Storage, location: &str) -> Result<Self> {
        if let Some(entry) = storage.get(location)? {
            if entry.value.len() != SALT_LEN {
                return Err(Error::Corrupted("salt"));
            }
            let mut bytes = [0u8; SALT_LEN];
            bytes.copy_from_slice(&entry.value);
            return Ok(Self { bytes });
        }

        let mut bytes = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        storage.put(StorageEntry::new(location, bytes.to_vec()))?;
        Ok(Self { bytes })
    }

    /// Hex-encoded HMAC-SHA256 of `input` under the salt. Stable for the
    /// lifetime of the mount, unguessable without the salt.
    pub fn salt_id(&self, input: &str) -> String {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(&self.bytes).expect("HMAC accepts any key length");
        mac.update(input.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}
