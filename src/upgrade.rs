// SPDX-License-Identifier: MIT OR Apache-2.0
//! Online upgrade from a flat non-versioned layout to the versioned layout.
//!
//! An atomic gate rejects user traffic while the conversion runs. A canary
//! record keeps the gate armed across restarts: if the process dies
//! mid-upgrade, the next initialization finds the canary and re-runs the
//! conversion from scratch. Conversions are idempotent per key because the
//! version-1 blob path is deterministic and the metadata write replaces any
//! prior record.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use prost::Message;
use tracing::{error, info};

use crate::backend::Backend;
use crate::storage::{collect_keys, Storage, StorageEntry};
use crate::types::{timestamp_now, KeyMetadata, UpgradeInfo, Version};
use crate::{Error, Result};

/// Log cadence while converting keys.
const PROGRESS_INTERVAL: usize = 500;

impl Backend {
    /// True while the upgrade gate is armed.
    pub fn is_upgrading(&self) -> bool {
        self.upgrading.load(Ordering::SeqCst) == 1
    }

    /// Arm the upgrade gate and run the conversion on a background thread.
    ///
    /// Fails if an upgrade is already running. On a worker failure the gate
    /// stays armed and the canary stays in place, so traffic keeps receiving
    /// the transient error until a restart retries the conversion.
    pub fn start_upgrade(self: &Arc<Self>, storage: Arc<dyn Storage>) -> Result<()> {
        if self
            .upgrading
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::InvalidRequest(
                "upgrade already in process".to_string(),
            ));
        }

        let backend = Arc::clone(self);
        std::thread::spawn(move || {
            if let Err(e) = backend.run_upgrade(storage.as_ref()) {
                error!(error = %e, "upgrading key/value data failed");
            }
        });
        Ok(())
    }

    /// The conversion itself. The caller must have armed the gate.
    pub(crate) fn run_upgrade(&self, storage: &dyn Storage) -> Result<()> {
        let canary_path = self.upgrading_path();
        let info = UpgradeInfo {
            started_time: Some(timestamp_now()),
        };
        storage.put(StorageEntry::new(&canary_path, info.encode_to_vec()))?;

        info!("collecting keys to upgrade");
        let keys = collect_keys(storage, "")?;
        info!(num_keys = keys.len(), "done collecting keys");

        let own_prefix = format!("{}/", self.storage_prefix());
        for (i, key) in keys.iter().enumerate() {
            if key == &canary_path || key.starts_with(&own_prefix) {
                continue;
            }
            if i % PROGRESS_INTERVAL == 0 {
                info!(progress = format!("{i}/{}", keys.len()), "upgrading keys");
            }
            if let Err(e) = self.upgrade_key(storage, key) {
                error!(key = %key, error = %e, "upgrading resulted in error");
                return Err(e);
            }
        }
        info!("upgrading keys finished");

        storage.delete(&canary_path)?;
        self.upgrading.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Convert one flat entry into a single-version history: blob first, then
    /// metadata, so an interrupted conversion never yields metadata pointing
    /// at a missing payload.
    fn upgrade_key(&self, storage: &dyn Storage, key: &str) -> Result<()> {
        let Some(entry) = storage.get(key)? else {
            return Ok(());
        };

        let lock = self.locks.for_key(key);
        let _guard = lock.write();

        let mut meta = KeyMetadata::new(key);
        let version_path = self.version_path(storage, key, meta.current_version + 1)?;
        let version = Version {
            data: entry.value,
            created_time: Some(timestamp_now()),
        };
        storage.put(StorageEntry::new(version_path, version.encode_to_vec()))?;

        meta.add_version(timestamp_now(), None, 1);
        self.write_key_metadata(storage, &meta)
    }
}
