// SPDX-License-Identifier: MIT OR Apache-2.0
//! Byte-level key/value storage as supplied by the host.
//!
//! The engine prefixes every path it writes with a per-instance storage
//! prefix; this module stays prefix-agnostic and only models the host's
//! contract: point get/put/delete plus a one-level prefix listing where
//! sub-directories carry a trailing `/`.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::{Error, Result};

/// A single stored entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEntry {
    pub key: String,
    pub value: Vec<u8>,
}

impl StorageEntry {
    pub fn new(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Host-provided byte KV. Failures are surfaced unchanged; the engine never
/// retries.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<StorageEntry>>;
    fn put(&self, entry: StorageEntry) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
    /// Direct children of `prefix`, sorted. Names that have further children
    /// end with `/`.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Walk `list` depth-first and return every leaf key under `prefix`.
pub fn collect_keys(storage: &dyn Storage, prefix: &str) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    let mut pending = vec![prefix.to_string()];

    while let Some(current) = pending.pop() {
        for name in storage.list(&current)? {
            let full = format!("{current}{name}");
            if name.ends_with('/') {
                pending.push(full);
            } else {
                keys.push(full);
            }
        }
    }

    keys.sort();
    Ok(keys)
}

/// In-memory storage used by tests and local tooling.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<StorageEntry>> {
        Ok(self
            .entries
            .read()
            .get(key)
            .map(|value| StorageEntry::new(key, value.clone())))
    }

    fn put(&self, entry: StorageEntry) -> Result<()> {
        if entry.key.is_empty() {
            return Err(Error::Storage("empty storage key".to_string()));
        }
        self.entries.write().insert(entry.key, entry.value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.read();
        let mut names: Vec<String> = Vec::new();

        for key in entries.keys() {
            let Some(rest) = key.strip_prefix(prefix) else {
                continue;
            };
            if rest.is_empty() {
                continue;
            }
            let name = match rest.find('/') {
                Some(idx) => &rest[..=idx],
                None => rest,
            };
            if names.last().map(String::as_str) != Some(name) {
                names.push(name.to_string());
            }
        }

        Ok(names)
    }
}
