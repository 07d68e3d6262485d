// SPDX-License-Identifier: MIT OR Apache-2.0
//! Handler for `destroy/<key>`: irreversible removal of listed version
//! payloads.

use tracing::warn;

use crate::backend::Backend;
use crate::delete::versions_param;
use crate::request::{Operation, Request, Response};
use crate::storage::Storage;
use crate::{Error, Result};

pub(crate) fn handle(backend: &Backend, req: &Request, key: &str) -> Result<Option<Response>> {
    if !matches!(req.operation, Operation::Create | Operation::Update) {
        return Err(Error::Unsupported(format!(
            "operation not supported on destroy: {:?}",
            req.operation
        )));
    }

    let versions = versions_param(req)?;
    let storage = req.storage.as_ref();

    let lock = backend.locks.for_key(key);
    let _guard = lock.write();

    let Some(mut meta) = backend.get_key_metadata(storage, key)? else {
        return Ok(None);
    };

    let mut destroyed = Vec::new();
    for version in versions {
        let Some(vm) = meta.versions.get_mut(&version) else {
            continue;
        };
        if vm.destroyed {
            continue;
        }
        vm.destroyed = true;
        destroyed.push(version);
    }

    if destroyed.is_empty() {
        return Ok(None);
    }

    // The flag is persisted before the blobs go away, so a crash in between
    // leaves only orphan blobs, never a readable destroyed version.
    backend.write_key_metadata(storage, &meta)?;

    let mut warnings = Vec::new();
    for version in destroyed {
        let path = backend.version_path(storage, key, version)?;
        if let Err(e) = storage.delete(&path) {
            warn!(key, version, error = %e, "failed to delete destroyed version blob");
            warnings.push(format!("failed to delete version {version}: {e}"));
        }
    }

    if warnings.is_empty() {
        Ok(None)
    } else {
        let mut resp = Response::new(serde_json::Map::new());
        for warning in warnings {
            resp.add_warning(warning);
        }
        Ok(Some(resp))
    }
}
