// SPDX-License-Identifier: MIT OR Apache-2.0
//! Handlers for `data/<key>`: versioned write, read, patch, and soft delete
//! of the current version.

use prost::Message;
use serde_json::{Map, Value};
use tracing::warn;

use crate::backend::Backend;
use crate::request::{Operation, Request, Response};
use crate::storage::{Storage, StorageEntry};
use crate::types::{
    scheduled_deletion_time, timestamp_now, timestamp_string, KeyMetadata, Version,
    VersionMetadata,
};
use crate::{Error, Result};

pub(crate) fn handle(backend: &Backend, req: &Request, key: &str) -> Result<Option<Response>> {
    match req.operation {
        Operation::Create | Operation::Update => write(backend, req, key),
        Operation::Read => read(backend, req, key),
        Operation::Delete => delete_current(backend, req, key),
        Operation::Patch => patch(backend, req, key),
        _ => Err(Error::Unsupported(format!(
            "operation not supported on data: {:?}",
            req.operation
        ))),
    }
}

/// User-facing metadata block for one version.
pub(crate) fn version_metadata_map(
    meta: &KeyMetadata,
    version: u64,
    vm: &VersionMetadata,
) -> Map<String, Value> {
    let mut out = Map::new();
    out.insert("version".to_string(), Value::from(version));
    out.insert(
        "created_time".to_string(),
        Value::from(timestamp_string(vm.created_time.as_ref())),
    );
    out.insert(
        "deletion_time".to_string(),
        Value::from(timestamp_string(vm.deletion_time.as_ref())),
    );
    out.insert("destroyed".to_string(), Value::from(vm.destroyed));
    out.insert(
        "custom_metadata".to_string(),
        custom_metadata_value(meta),
    );
    out
}

/// Custom metadata as a JSON object, or null when none is set.
pub(crate) fn custom_metadata_value(meta: &KeyMetadata) -> Value {
    if meta.custom_metadata.is_empty() {
        return Value::Null;
    }
    let mut entries: Vec<_> = meta.custom_metadata.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    Value::Object(
        entries
            .into_iter()
            .map(|(k, v)| (k.clone(), Value::from(v.clone())))
            .collect(),
    )
}

/// Accept a version parameter as a JSON number or numeric string; 0 or
/// absent selects the current version.
pub(crate) fn version_param(value: Option<&Value>) -> Result<u64> {
    match value {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(n)) => n.as_u64().ok_or_else(|| {
            Error::InvalidRequest("version must be an unsigned integer".to_string())
        }),
        Some(Value::String(s)) => s.parse().map_err(|_| {
            Error::InvalidRequest("version must be an unsigned integer".to_string())
        }),
        Some(_) => Err(Error::InvalidRequest(
            "version must be an unsigned integer".to_string(),
        )),
    }
}

/// Validate the `options` block and enforce check-and-set against the key's
/// current version. Must run with the metadata loaded, under the key lock.
fn check_cas(
    req: &Request,
    meta: &KeyMetadata,
    config_cas_required: bool,
) -> Result<()> {
    let options = match req.data.get("options") {
        None => None,
        Some(Value::Object(map)) => Some(map),
        Some(_) => {
            return Err(Error::InvalidRequest(
                "options must be a map".to_string(),
            ))
        },
    };

    let mut cas = None;
    if let Some(options) = options {
        for (name, value) in options {
            match name.as_str() {
                "cas" => cas = Some(value),
                other => {
                    return Err(Error::InvalidRequest(format!(
                        "unknown option: {other}"
                    )))
                },
            }
        }
    }

    match cas {
        None if config_cas_required || meta.cas_required => Err(Error::InvalidRequest(
            "check-and-set parameter required for this call".to_string(),
        )),
        None => Ok(()),
        Some(value) => {
            let cas = value.as_u64().ok_or_else(|| {
                Error::InvalidRequest(
                    "check-and-set parameter must be an unsigned integer".to_string(),
                )
            })?;
            if cas != meta.current_version {
                return Err(Error::InvalidRequest(
                    "check-and-set parameter did not match the current version".to_string(),
                ));
            }
            Ok(())
        },
    }
}

/// Write the payload as the key's next version and persist the updated
/// metadata. Trimmed versions have their blobs deleted best-effort; a
/// cleanup failure is reported as a warning, not an error.
fn store_new_version(
    backend: &Backend,
    storage: &dyn Storage,
    key: &str,
    meta: &mut KeyMetadata,
    payload: Vec<u8>,
    config_max_versions: u32,
    config_delete_after_secs: i64,
) -> Result<Response> {
    let now = timestamp_now();

    let version_path = backend.version_path(storage, key, meta.current_version + 1)?;
    let blob = Version {
        data: payload,
        created_time: Some(now.clone()),
    };
    storage.put(StorageEntry::new(version_path, blob.encode_to_vec()))?;

    let deletion_time = scheduled_deletion_time(
        &now,
        meta.delete_version_after_secs(),
        config_delete_after_secs,
    );
    let removed = meta.add_version(now, deletion_time, config_max_versions);
    backend.write_key_metadata(storage, meta)?;

    let vm = meta
        .versions
        .get(&meta.current_version)
        .expect("the version just added is always retained");
    let mut resp = Response::new(version_metadata_map(meta, meta.current_version, vm));

    for version in removed {
        let path = backend.version_path(storage, key, version)?;
        if let Err(e) = storage.delete(&path) {
            warn!(key, version, error = %e, "failed to delete trimmed version blob");
            resp.add_warning(format!("failed to clean up version {version}: {e}"));
        }
    }

    Ok(resp)
}

fn write(backend: &Backend, req: &Request, key: &str) -> Result<Option<Response>> {
    let storage = req.storage.as_ref();
    let config = backend.config(storage)?;

    // Fail before taking the lock when no payload was sent.
    let payload = match req.data.get("data") {
        None => return Err(Error::InvalidRequest("no data provided".to_string())),
        Some(Value::Object(map)) => serde_json::to_vec(&Value::Object(map.clone()))
            .map_err(|e| Error::InvalidRequest(format!("failed to encode data: {e}")))?,
        Some(_) => return Err(Error::InvalidRequest("data must be a map".to_string())),
    };

    let lock = backend.locks.for_key(key);
    let _guard = lock.write();

    let mut meta = backend
        .get_key_metadata(storage, key)?
        .unwrap_or_else(|| KeyMetadata::new(key));

    check_cas(req, &meta, config.cas_required)?;

    let resp = store_new_version(
        backend,
        storage,
        key,
        &mut meta,
        payload,
        config.max_versions,
        config.delete_version_after_secs(),
    )?;
    Ok(Some(resp))
}

fn read(backend: &Backend, req: &Request, key: &str) -> Result<Option<Response>> {
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
    data.insert("data".to_string(), Value::Null);
    data.insert(
        "metadata".to_string(),
        Value::Object(version_metadata_map(&meta, version, vm)),
    );

    // Deleted (including past scheduled deletion) and destroyed versions
    // keep their metadata visible but carry no payload.
    if vm.is_deleted() || vm.destroyed {
        return Ok(Some(Response::not_found(data)));
    }

    let version_path = backend.version_path(storage, key, version)?;
    let Some(entry) = storage.get(&version_path)? else {
        return Err(Error::VersionBlobMissing);
    };
    let blob =
        Version::decode(entry.value.as_slice()).map_err(|_| Error::Corrupted("version"))?;
    let payload: Map<String, Value> =
        serde_json::from_slice(&blob.data).map_err(|_| Error::Corrupted("version data"))?;

    data.insert("data".to_string(), Value::Object(payload));
    Ok(Some(Response::new(data)))
}

fn delete_current(backend: &Backend, req: &Request, key: &str) -> Result<Option<Response>> {
    let storage = req.storage.as_ref();

    let lock = backend.locks.for_key(key);
    let _guard = lock.write();

    let Some(mut meta) = backend.get_key_metadata(storage, key)? else {
        return Ok(None);
    };

    let current = meta.current_version;
    let Some(vm) = meta.versions.get_mut(&current) else {
        return Ok(None);
    };
    if vm.destroyed || vm.is_deleted() {
        return Ok(None);
    }

    vm.deletion_time = Some(timestamp_now());
    backend.write_key_metadata(storage, &meta)?;
    Ok(None)
}

fn patch(backend: &Backend, req: &Request, key: &str) -> Result<Option<Response>> {
    let storage = req.storage.as_ref();
    let config = backend.config(storage)?;

    let patch_data = match req.data.get("data") {
        None => return Err(Error::InvalidRequest("no data provided".to_string())),
        Some(Value::Object(map)) => map,
        Some(_) => return Err(Error::InvalidRequest("data must be a map".to_string())),
    };

    let lock = backend.locks.for_key(key);
    let _guard = lock.write();

    let Some(mut meta) = backend.get_key_metadata(storage, key)? else {
        return Ok(Some(Response::not_found(Map::new())));
    };

    check_cas(req, &meta, config.cas_required)?;

    let current = meta.current_version;
    let Some(vm) = meta.versions.get(&current) else {
        return Ok(Some(Response::not_found(Map::new())));
    };

    // A deleted or destroyed current version is not patchable; no new
    // version is created.
    if vm.is_deleted() || vm.destroyed {
        let mut data = Map::new();
        data.insert("data".to_string(), Value::Null);
        data.insert(
            "metadata".to_string(),
            Value::Object(version_metadata_map(&meta, current, vm)),
        );
        return Ok(Some(Response::not_found(data)));
    }

    let version_path = backend.version_path(storage, key, current)?;
    let Some(entry) = storage.get(&version_path)? else {
        return Err(Error::VersionBlobMissing);
    };
    let blob =
        Version::decode(entry.value.as_slice()).map_err(|_| Error::Corrupted("version"))?;
    let mut merged: Map<String, Value> =
        serde_json::from_slice(&blob.data).map_err(|_| Error::Corrupted("version data"))?;

    json_merge_patch(&mut merged, patch_data);

    let payload = serde_json::to_vec(&Value::Object(merged))
        .map_err(|e| Error::InvalidRequest(format!("failed to encode data: {e}")))?;
    let resp = store_new_version(
        backend,
        storage,
        key,
        &mut meta,
        payload,
        config.max_versions,
        config.delete_version_after_secs(),
    )?;
    Ok(Some(resp))
}

/// Recursive merge of `patch` into `dest`: nested maps merge, scalars and
/// arrays replace, an explicit null removes the key.
pub(crate) fn json_merge_patch(dest: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        match value {
            Value::Null => {
                dest.remove(key);
            },
            Value::Object(patch_child) => {
                if let Some(Value::Object(existing)) = dest.get_mut(key) {
                    json_merge_patch(existing, patch_child);
                } else {
                    let mut fresh = Map::new();
                    json_merge_patch(&mut fresh, patch_child);
                    dest.insert(key.clone(), Value::Object(fresh));
                }
            },
            other => {
                dest.insert(key.clone(), other.clone());
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendConfig;
    use crate::storage::MemoryStorage;
    use std::sync::Arc;

    fn setup() -> (Arc<Backend>, Arc<dyn Storage>) {
        let backend = Backend::factory(BackendConfig {
            backend_uuid: "data-test".to_string(),
            upgrade: false,
        })
        .unwrap();
        (backend, Arc::new(MemoryStorage::new()))
    }

    fn run(
        backend: &Backend,
        storage: &Arc<dyn Storage>,
        op: Operation,
        path: &str,
        body: Value,
    ) -> Result<Option<Response>> {
        let req = Request::new(op, path, Arc::clone(storage))
            .with_data(body.as_object().cloned().unwrap_or_default());
        backend.handle_request(&req)
    }

    fn write_ok(
        backend: &Backend,
        storage: &Arc<dyn Storage>,
        key: &str,
        body: Value,
    ) -> Response {
        run(backend, storage, Operation::Create, &format!("data/{key}"), body)
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let (backend, storage) = setup();

        let resp = write_ok(
            &backend,
            &storage,
            "foo",
            serde_json::json!({"data": {"bar": "baz", "n": 3, "pi": 3.25}}),
        );
        assert_eq!(resp.data.get("version"), Some(&Value::from(1u64)));
        assert_eq!(resp.data.get("destroyed"), Some(&Value::from(false)));
        assert_ne!(resp.data.get("created_time"), Some(&Value::from("")));

        let read = run(&backend, &storage, Operation::Read, "data/foo", serde_json::json!({}))
            .unwrap()
            .unwrap();
        // Integer and float distinction survives the round trip.
        assert_eq!(
            read.data.get("data"),
            Some(&serde_json::json!({"bar": "baz", "n": 3, "pi": 3.25}))
        );
    }

    #[test]
    fn test_write_without_data_rejected() {
        let (backend, storage) = setup();
        let err = run(
            &backend,
            &storage,
            Operation::Create,
            "data/foo",
            serde_json::json!({"options": {}}),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "no data provided");
    }

    #[test]
    fn test_read_missing_key_is_empty() {
        let (backend, storage) = setup();
        let resp = run(&backend, &storage, Operation::Read, "data/none", serde_json::json!({}))
            .unwrap();
        assert!(resp.is_none());
    }

    #[test]
    fn test_read_specific_version() {
        let (backend, storage) = setup();
        write_ok(&backend, &storage, "foo", serde_json::json!({"data": {"v": 1}}));
        write_ok(&backend, &storage, "foo", serde_json::json!({"data": {"v": 2}}));

        let resp = run(
            &backend,
            &storage,
            Operation::Read,
            "data/foo",
            serde_json::json!({"version": 1}),
        )
        .unwrap()
        .unwrap();
        assert_eq!(resp.data.get("data"), Some(&serde_json::json!({"v": 1})));

        let missing = run(
            &backend,
            &storage,
            Operation::Read,
            "data/foo",
            serde_json::json!({"version": 9}),
        )
        .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_cas_required_by_config() {
        let (backend, storage) = setup();
        run(
            &backend,
            &storage,
            Operation::Update,
            "config",
            serde_json::json!({"cas_required": true}),
        )
        .unwrap();

        let err = run(
            &backend,
            &storage,
            Operation::Create,
            "data/foo",
            serde_json::json!({"data": {"a": 1}}),
        )
        .unwrap_err();
        assert!(err
            .to_string()
            .contains("check-and-set parameter required"));

        // cas=0 works for a fresh key.
        let resp = write_ok(
            &backend,
            &storage,
            "foo",
            serde_json::json!({"data": {"a": 1}, "options": {"cas": 0}}),
        );
        assert_eq!(resp.data.get("version"), Some(&Value::from(1u64)));

        // A stale cas=0 no longer matches.
        let err = run(
            &backend,
            &storage,
            Operation::Create,
            "data/foo",
            serde_json::json!({"data": {"a": 2}, "options": {"cas": 0}}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("check-and-set parameter did not match"));
    }

    #[test]
    fn test_cas_mismatch_rejected_without_requirement() {
        let (backend, storage) = setup();
        write_ok(&backend, &storage, "foo", serde_json::json!({"data": {"a": 1}}));

        let err = run(
            &backend,
            &storage,
            Operation::Update,
            "data/foo",
            serde_json::json!({"data": {"a": 2}, "options": {"cas": 5}}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("did not match the current version"));
    }

    #[test]
    fn test_unknown_option_rejected() {
        let (backend, storage) = setup();
        let err = run(
            &backend,
            &storage,
            Operation::Create,
            "data/foo",
            serde_json::json!({"data": {"a": 1}, "options": {"caz": 0}}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown option"));
    }

    #[test]
    fn test_retention_trim_deletes_blobs() {
        let (backend, storage) = setup();
        run(
            &backend,
            &storage,
            Operation::Update,
            "config",
            serde_json::json!({"max_versions": 2}),
        )
        .unwrap();

        for i in 1..=3 {
            write_ok(&backend, &storage, "foo", serde_json::json!({"data": {"i": i}}));
        }

        // Version 1 fell out of retention: metadata gone, blob gone.
        let resp = run(
            &backend,
            &storage,
            Operation::Read,
            "data/foo",
            serde_json::json!({"version": 1}),
        )
        .unwrap();
        assert!(resp.is_none());

        let path = backend.version_path(storage.as_ref(), "foo", 1).unwrap();
        assert!(storage.get(&path).unwrap().is_none());
    }

    #[test]
    fn test_delete_current_soft_deletes() {
        let (backend, storage) = setup();
        write_ok(&backend, &storage, "foo", serde_json::json!({"data": {"a": 1}}));

        let resp = run(&backend, &storage, Operation::Delete, "data/foo", serde_json::json!({}))
            .unwrap();
        assert!(resp.is_none());

        let read = run(&backend, &storage, Operation::Read, "data/foo", serde_json::json!({}))
            .unwrap()
            .unwrap();
        assert_eq!(read.status, Some(404));
        let metadata = read.data.get("metadata").unwrap().as_object().unwrap();
        assert_ne!(metadata.get("deletion_time"), Some(&Value::from("")));
        assert_eq!(read.data.get("data"), Some(&Value::Null));
    }

    #[test]
    fn test_archival_hides_expired_version() {
        let (backend, storage) = setup();
        run(
            &backend,
            &storage,
            Operation::Update,
            "config",
            serde_json::json!({"delete_version_after": "-1s"}),
        )
        .unwrap();

        // Disabled sentinel: no schedule is applied.
        let resp = write_ok(&backend, &storage, "foo", serde_json::json!({"data": {"a": 1}}));
        assert_eq!(resp.data.get("deletion_time"), Some(&Value::from("")));

        // A small positive window produces a deletion time.
        run(
            &backend,
            &storage,
            Operation::Update,
            "config",
            serde_json::json!({"delete_version_after": "1h"}),
        )
        .unwrap();
        let resp = write_ok(&backend, &storage, "bar", serde_json::json!({"data": {"a": 1}}));
        assert_ne!(resp.data.get("deletion_time"), Some(&Value::from("")));

        // Future deletion time still reads fine.
        let read = run(&backend, &storage, Operation::Read, "data/bar", serde_json::json!({}))
            .unwrap()
            .unwrap();
        assert_eq!(read.status, None);
    }

    #[test]
    fn test_patch_merges_and_bumps_version() {
        let (backend, storage) = setup();
        write_ok(
            &backend,
            &storage,
            "foo",
            serde_json::json!({"data": {"keep": 1, "nested": {"a": 1, "b": 2}, "drop": true}}),
        );

        let resp = run(
            &backend,
            &storage,
            Operation::Patch,
            "data/foo",
            serde_json::json!({"data": {"nested": {"b": 3}, "drop": null, "added": "x"}}),
        )
        .unwrap()
        .unwrap();
        assert_eq!(resp.data.get("version"), Some(&Value::from(2u64)));

        let read = run(&backend, &storage, Operation::Read, "data/foo", serde_json::json!({}))
            .unwrap()
            .unwrap();
        assert_eq!(
            read.data.get("data"),
            Some(&serde_json::json!({
                "keep": 1,
                "nested": {"a": 1, "b": 3},
                "added": "x"
            }))
        );
    }

    #[test]
    fn test_patch_missing_key_404() {
        let (backend, storage) = setup();
        let resp = run(
            &backend,
            &storage,
            Operation::Patch,
            "data/none",
            serde_json::json!({"data": {"a": 1}}),
        )
        .unwrap()
        .unwrap();
        assert_eq!(resp.status, Some(404));
    }

    #[test]
    fn test_patch_deleted_version_404_no_new_version() {
        let (backend, storage) = setup();
        write_ok(&backend, &storage, "foo", serde_json::json!({"data": {"a": 1}}));
        run(&backend, &storage, Operation::Delete, "data/foo", serde_json::json!({})).unwrap();

        let resp = run(
            &backend,
            &storage,
            Operation::Patch,
            "data/foo",
            serde_json::json!({"data": {"a": 2}}),
        )
        .unwrap()
        .unwrap();
        assert_eq!(resp.status, Some(404));

        let meta = backend
            .get_key_metadata(storage.as_ref(), "foo")
            .unwrap()
            .unwrap();
        assert_eq!(meta.current_version, 1);
    }

    #[test]
    fn test_json_merge_patch_replaces_non_maps() {
        let mut dest = serde_json::json!({"a": [1, 2], "b": {"c": 1}})
            .as_object()
            .cloned()
            .unwrap();
        let patch = serde_json::json!({"a": [3], "b": "scalar"})
            .as_object()
            .cloned()
            .unwrap();

        json_merge_patch(&mut dest, &patch);
        assert_eq!(
            Value::Object(dest),
            serde_json::json!({"a": [3], "b": "scalar"})
        );
    }

    #[test]
    fn test_json_merge_patch_strips_nulls_in_new_subtrees() {
        let mut dest = Map::new();
        let patch = serde_json::json!({"sub": {"keep": 1, "gone": null}})
            .as_object()
            .cloned()
            .unwrap();

        json_merge_patch(&mut dest, &patch);
        assert_eq!(Value::Object(dest), serde_json::json!({"sub": {"keep": 1}}));
    }
}
