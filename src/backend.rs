// SPDX-License-Identifier: MIT OR Apache-2.0
//! Backend construction, shared caches, and request dispatch.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use prost::Message;

use crate::encrypted::EncryptedKeyStorage;
use crate::locks::LockPool;
use crate::policy::KeyPolicy;
use crate::request::{Request, Response};
use crate::salt::{Salt, SALT_LOCATION};
use crate::storage::{Storage, StorageEntry};
use crate::types::{Configuration, KeyMetadata};
use crate::{config, data, delete, destroy, meta, subkeys};
use crate::{Error, Result};

/// Construction-time settings supplied by the host.
pub struct BackendConfig {
    /// Per-instance storage prefix; typically the mount's UUID.
    pub backend_uuid: String,
    /// Convert pre-existing flat entries into the versioned layout during
    /// initialization.
    pub upgrade: bool,
}

/// Versioned key/value backend.
///
/// Holds no storage reference of its own: the storage view travels with each
/// request. The salt, key policy, and configuration are lazily loaded caches
/// guarded by reader/writer locks so replicas can drop them on `invalidate`.
pub struct Backend {
    storage_prefix: String,
    upgrade_requested: bool,
    pub(crate) locks: LockPool,
    salt: RwLock<Option<Arc<Salt>>>,
    policy: RwLock<Option<Arc<KeyPolicy>>>,
    config_cache: RwLock<Option<Arc<Configuration>>>,
    /// 0 = serving, 1 = upgrade in progress. Checked on every request.
    pub(crate) upgrading: AtomicU32,
}

impl Backend {
    /// Build a backend for the given mount.
    pub fn factory(conf: BackendConfig) -> Result<Arc<Self>> {
        if conf.backend_uuid.is_empty() {
            return Err(Error::InvalidRequest(
                "could not initialize versioned K/V store, no UUID was provided".to_string(),
            ));
        }

        Ok(Arc::new(Self {
            storage_prefix: conf.backend_uuid,
            upgrade_requested: conf.upgrade,
            locks: LockPool::new(),
            salt: RwLock::new(None),
            policy: RwLock::new(None),
            config_cache: RwLock::new(None),
            upgrading: AtomicU32::new(0),
        }))
    }

    /// Host initialization hook. Starts the flat-to-versioned upgrade when
    /// requested, or resumes one whose canary survived a restart.
    pub fn initialize(self: &Arc<Self>, storage: Arc<dyn Storage>) -> Result<()> {
        let canary_present = storage.get(&self.upgrading_path())?.is_some();
        if self.upgrade_requested || canary_present {
            self.start_upgrade(storage)?;
        }
        Ok(())
    }

    /// Serve one request. Every user operation is rejected while the upgrade
    /// gate is armed; only the upgrade worker itself bypasses this check.
    pub fn handle_request(&self, req: &Request) -> Result<Option<Response>> {
        if self.upgrading.load(Ordering::SeqCst) == 1 {
            return Err(Error::UpgradeInProgress);
        }

        let path = req.path.as_str();
        if path == "config" {
            config::handle(self, req)
        } else if let Some(key) = path.strip_prefix("data/") {
            data::handle(self, req, key)
        } else if let Some(key) = path.strip_prefix("delete/") {
            delete::handle_delete(self, req, key)
        } else if let Some(key) = path.strip_prefix("undelete/") {
            delete::handle_undelete(self, req, key)
        } else if let Some(key) = path.strip_prefix("destroy/") {
            destroy::handle(self, req, key)
        } else if let Some(key) = path.strip_prefix("subkeys/") {
            subkeys::handle(self, req, key)
        } else if let Some(key) = path.strip_prefix("metadata-recursive/") {
            meta::handle_recursive(self, req, key)
        } else if let Some(key) = path.strip_prefix("metadata/") {
            meta::handle(self, req, key)
        } else {
            Err(Error::Unsupported(format!("no handler for path {path:?}")))
        }
    }

    /// Replication cache hook: drop the cached value for a storage path so
    /// the next access re-reads it.
    pub fn invalidate(&self, path: &str) {
        if path == self.salt_path() {
            *self.salt.write() = None;
        } else if path == self.policy_path() {
            *self.policy.write() = None;
        } else if path == self.config_path() {
            *self.config_cache.write() = None;
        }
    }

    /// Storage paths the host should seal-wrap.
    pub fn seal_wrap_paths(&self) -> Vec<String> {
        vec![
            format!("{}/versions/", self.storage_prefix),
            format!("{}/policy/", self.storage_prefix),
            self.salt_path(),
        ]
    }

    pub fn storage_prefix(&self) -> &str {
        &self.storage_prefix
    }

    pub(crate) fn salt_path(&self) -> String {
        format!("{}/{}", self.storage_prefix, SALT_LOCATION)
    }

    pub(crate) fn policy_path(&self) -> String {
        format!("{}/policy/metadata", self.storage_prefix)
    }

    pub(crate) fn config_path(&self) -> String {
        format!("{}/config", self.storage_prefix)
    }

    pub(crate) fn upgrading_path(&self) -> String {
        format!("{}/upgrading", self.storage_prefix)
    }

    fn metadata_prefix(&self) -> String {
        format!("{}/metadata/", self.storage_prefix)
    }

    /// The path-derivation salt, loading and persisting it on first access.
    pub(crate) fn salt(&self, storage: &dyn Storage) -> Result<Arc<Salt>> {
        if let Some(salt) = self.salt.read().as_ref() {
            return Ok(Arc::clone(salt));
        }

        let mut cached = self.salt.write();
        if let Some(salt) = cached.as_ref() {
            return Ok(Arc::clone(salt));
        }
        let salt = Arc::new(Salt::load_or_generate(storage, &self.salt_path())?);
        *cached = Some(Arc::clone(&salt));
        Ok(salt)
    }

    fn key_policy(&self, storage: &dyn Storage) -> Result<Arc<KeyPolicy>> {
        if let Some(policy) = self.policy.read().as_ref() {
            return Ok(Arc::clone(policy));
        }

        let mut cached = self.policy.write();
        if let Some(policy) = cached.as_ref() {
            return Ok(Arc::clone(policy));
        }
        let policy = Arc::new(KeyPolicy::load_or_rotate(storage, &self.policy_path())?);
        *cached = Some(Arc::clone(&policy));
        Ok(policy)
    }

    /// Encrypted view of the metadata namespace.
    pub(crate) fn encrypted_metadata(&self, storage: &dyn Storage) -> Result<EncryptedKeyStorage> {
        let policy = self.key_policy(storage)?;
        Ok(EncryptedKeyStorage::new(policy, self.metadata_prefix()))
    }

    /// Backend configuration snapshot; absent storage yields the defaults.
    pub(crate) fn config(&self, storage: &dyn Storage) -> Result<Arc<Configuration>> {
        if let Some(config) = self.config_cache.read().as_ref() {
            return Ok(Arc::clone(config));
        }

        let mut cached = self.config_cache.write();
        if let Some(config) = cached.as_ref() {
            return Ok(Arc::clone(config));
        }

        let config = match storage.get(&self.config_path())? {
            Some(entry) => Configuration::decode(entry.value.as_slice())
                .map_err(|_| Error::Corrupted("configuration"))?,
            None => Configuration::default(),
        };
        let config = Arc::new(config);
        *cached = Some(Arc::clone(&config));
        Ok(config)
    }

    pub(crate) fn set_config(&self, storage: &dyn Storage, config: Configuration) -> Result<()> {
        storage.put(StorageEntry::new(
            self.config_path(),
            config.encode_to_vec(),
        ))?;
        *self.config_cache.write() = Some(Arc::new(config));
        Ok(())
    }

    /// Metadata record for `key`, or `None` when the key has never been
    /// written.
    pub(crate) fn get_key_metadata(
        &self,
        storage: &dyn Storage,
        key: &str,
    ) -> Result<Option<KeyMetadata>> {
        let es = self.encrypted_metadata(storage)?;
        let Some(raw) = es.get(storage, key)? else {
            return Ok(None);
        };
        let meta =
            KeyMetadata::decode(raw.as_slice()).map_err(|_| Error::Corrupted("key metadata"))?;
        Ok(Some(meta))
    }

    pub(crate) fn write_key_metadata(
        &self,
        storage: &dyn Storage,
        meta: &KeyMetadata,
    ) -> Result<()> {
        let es = self.encrypted_metadata(storage)?;
        es.put(storage, &meta.key, meta.encode_to_vec())
    }

    pub(crate) fn delete_key_metadata(&self, storage: &dyn Storage, key: &str) -> Result<()> {
        let es = self.encrypted_metadata(storage)?;
        es.delete(storage, key)
    }

    /// Storage path of one version's payload blob: a salted hash split into
    /// a two-level directory so no single directory grows pathologically
    /// wide.
    pub fn version_path(
        &self,
        storage: &dyn Storage,
        key: &str,
        version: u64,
    ) -> Result<String> {
        let salt = self.salt(storage)?;
        let salted = salt.salt_id(&format!("{key}|{version}"));
        Ok(format!(
            "{}/versions/{}/{}",
            self.storage_prefix,
            &salted[..3],
            &salted[3..]
        ))
    }
}
