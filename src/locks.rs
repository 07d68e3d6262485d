// SPDX-License-Identifier: MIT OR Apache-2.0
//! Striped per-key lock pool.
//!
//! A fixed pool of 256 reader/writer locks serializes metadata and version
//! writes per logical key while letting distinct keys proceed in parallel.
//! Two keys may share a stripe; that contention is bounded and acceptable.

use parking_lot::RwLock;
use sha2::{Digest, Sha256};

/// Pool size. A design constant, not a tunable.
pub const LOCK_COUNT: usize = 256;

/// Fixed pool of striped locks indexed by a hash of the logical key.
pub struct LockPool {
    locks: Vec<RwLock<()>>,
}

impl LockPool {
    pub fn new() -> Self {
        Self {
            locks: (0..LOCK_COUNT).map(|_| RwLock::new(())).collect(),
        }
    }

    /// The stripe for `key`. Callers take the write side for any mutation and
    /// the read side for data/subkeys reads; no nested acquisition.
    pub fn for_key(&self, key: &str) -> &RwLock<()> {
        let digest = Sha256::digest(key.as_bytes());
        &self.locks[digest[0] as usize]
    }
}

impl Default for LockPool {
    fn default() -> Self {
        Self::new()
    }
}
