// SPDX-License-Identifier: MIT OR Apache-2.0
//! Handler for `subkeys/<key>`: the shape of a secret without its values.

use prost::Message;
use serde_json::{Map, Value};

use crate::backend::Backend;
use crate::data::{version_metadata_map, version_param};
use crate::request::{Operation, Request, Response};
use crate::storage::Storage;
use crate::types::Version;
use crate::{Error, Result};

/// Nesting depth beyond which maps are treated as leaves.
const MAX_SUBKEYS_DEPTH: usize = 100;

pub(crate) fn handle(backend: &Backend, req: &Request, key: &str) -> Result<Option<Response>> {
    if req.operation != Operation::Read {
        return Err(Error::Unsupported(format!(
            "operation not supported on subkeys: {:?}",
            req.operation
        )));
    }

    let storage = req.storage.as_ref();

    let lock = backend.locks.for_key(key);
    let _guard = lock.read();

    let Some(meta) = backend.get_key_metadata(storage, key)? else {
        return Ok(None);
    };

    let mut version = version_param(req.data.get("version"))?;
    if version == 0 {
        version = meta.current_version;
    }
    let Some(vm) = meta.versions.get(&version) else {
        return Ok(None);
    };

    let mut data = Map::new();
    data.insert("subkeys".to_string(), Value::Null);
    data.insert(
        "metadata".to_string(),
        Value::Object(version_metadata_map(&meta, version, vm)),
    );

    if vm.is_deleted() || vm.destroyed {
        return Ok(Some(Response::not_found(data)));
    }

    let version_path = backend.version_path(storage, key, version)?;
    let Some(entry) = storage.get(&version_path)? else {
        return Err(Error::VersionBlobMissing);
    };
    let blob =
        Version::decode(entry.value.as_slice()).map_err(|_| Error::Corrupted("version"))?;
    let mut payload: Map<String, Value> =
        serde_json::from_slice(&blob.data).map_err(|_| Error::Corrupted("version data"))?;

    remove_values(&mut payload, MAX_SUBKEYS_DEPTH);
    data.insert("subkeys".to_string(), Value::Object(payload));

    Ok(Some(Response::new(data)))
}

/// Replace every leaf with null, in place. A nested map is a leaf when it is
/// empty or sits at `max_depth`; nulling at the cap also keeps deep values
/// from leaking into the response.
pub(crate) fn remove_values(input: &mut Map<String, Value>, max_depth: usize) {
    walk(input, 1, max_depth);
}

fn walk(map: &mut Map<String, Value>, depth: usize, max_depth: usize) {
    for value in map.values_mut() {
        match value {
            Value::Object(child) if depth < max_depth && !child.is_empty() => {
                walk(child, depth + 1, max_depth);
            },
            other => {
                *other = Value::Null;
            },
        }
    }
}
