// SPDX-License-Identifier: MIT OR Apache-2.0
//! Storage wrapper that encrypts every path component of a logical key.
//!
//! Listings of the underlying storage disclose only base64 ciphertext names;
//! the convergent policy lets `get` recompute the exact path `put` used.

use std::sync::Arc;

use tracing::warn;

use crate::policy::KeyPolicy;
use crate::storage::{Storage, StorageEntry};
use crate::Result;

/// View of a storage subtree keyed by encrypted logical paths.
///
/// The wrapper owns the policy and prefix only; the storage reference is
/// supplied per call because it travels with each request.
pub struct EncryptedKeyStorage {
    policy: Arc<KeyPolicy>,
    /// Underlying prefix, ending in `/`.
    prefix: String,
}

impl EncryptedKeyStorage {
    pub fn new(policy: Arc<KeyPolicy>, prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self { policy, prefix }
    }

    /// Encrypt each `/`-separated component of `key` and join them under the
    /// prefix.
    fn encrypted_path(&self, key: &str) -> Result<String> {
        let mut path = self.prefix.clone();
        let mut first = true;
        for component in key.split('/').filter(|c| !c.is_empty()) {
            if !first {
                path.push('/');
            }
            path.push_str(&self.policy.encrypt_component(component)?);
            first = false;
        }
        Ok(path)
    }

    pub fn get(&self, storage: &dyn Storage, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.encrypted_path(key)?;
        Ok(storage.get(&path)?.map(|entry| entry.value))
    }

    pub fn put(&self, storage: &dyn Storage, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.encrypted_path(key)?;
        storage.put(StorageEntry::new(path, value))
    }

    pub fn delete(&self, storage: &dyn Storage, key: &str) -> Result<()> {
        let path = self.encrypted_path(key)?;
        storage.delete(&path)
    }

    /// List the children of a logical prefix, decrypting each name back to
    /// plaintext. Directory markers keep their trailing `/`. Entries that do
    /// not decrypt are foreign to this policy and are skipped.
    pub fn list(&self, storage: &dyn Storage, key_prefix: &str) -> Result<Vec<String>> {
        let mut path = self.encrypted_path(key_prefix)?;
        if !path.ends_with('/') {
            path.push('/');
        }

        let mut names = Vec::new();
        for encrypted in storage.list(&path)? {
            let (component, marker) = match encrypted.strip_suffix('/') {
                Some(stripped) => (stripped, "/"),
                None => (encrypted.as_str(), ""),
            };
            match self.policy.decrypt_component(component) {
                Ok(name) => names.push(format!("{name}{marker}")),
                Err(_) => {
                    warn!(entry = %encrypted, "skipping undecryptable listing entry");
                },
            }
        }

        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn encrypted_storage() -> (MemoryStorage, EncryptedKeyStorage) {
        let storage = MemoryStorage::new();
        let policy = KeyPolicy::load_or_rotate(&storage, "u/policy/metadata").unwrap();
        (storage, EncryptedKeyStorage::new(Arc::new(policy), "u/metadata/"))
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (storage, es) = encrypted_storage();
        es.put(&storage, "app/db/creds", b"payload".to_vec()).unwrap();

        assert_eq!(
            es.get(&storage, "app/db/creds").unwrap(),
            Some(b"payload".to_vec())
        );
    }

    #[test]
    fn test_plaintext_never_in_storage_paths() {
        let (storage, es) = encrypted_storage();
        es.put(&storage, "app/db/creds", b"payload".to_vec()).unwrap();

        let keys = crate::storage::collect_keys(&storage, "u/metadata/").unwrap();
        assert_eq!(keys.len(), 1);
        for segment in ["app", "db", "creds"] {
            assert!(!keys[0].contains(segment));
        }
    }

    #[test]
    fn test_delete_removes_entry() {
        let (storage, es) = encrypted_storage();
        es.put(&storage, "one", b"1".to_vec()).unwrap();
        es.delete(&storage, "one").unwrap();

        assert_eq!(es.get(&storage, "one").unwrap(), None);
    }

    #[test]
    fn test_list_decrypts_names_and_markers() {
        let (storage, es) = encrypted_storage();
        es.put(&storage, "apple", b"1".to_vec()).unwrap();
        es.put(&storage, "nested/leaf", b"2".to_vec()).unwrap();
        es.put(&storage, "nested/other", b"3".to_vec()).unwrap();

        assert_eq!(es.list(&storage, "").unwrap(), vec!["apple", "nested/"]);
        assert_eq!(
            es.list(&storage, "nested").unwrap(),
            vec!["leaf", "other"]
        );
    }

    #[test]
    fn test_list_skips_foreign_entries() {
        let (storage, es) = encrypted_storage();
        es.put(&storage, "good", b"1".to_vec()).unwrap();
        storage
            .put(StorageEntry::new("u/metadata/not-encrypted", b"x".to_vec()))
            .unwrap();

        assert_eq!(es.list(&storage, "").unwrap(), vec!["good"]);
    }

    #[test]
    fn test_get_missing_is_none() {
        let (storage, es) = encrypted_storage();
        assert_eq!(es.get(&storage, "ghost").unwrap(), None);
    }
}
