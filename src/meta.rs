// SPDX-License-Identifier: MIT OR Apache-2.0
//! Handlers for `metadata/<key>`: policy fields, custom metadata, full-key
//! destruction, and listings (flat and recursive).

use std::collections::VecDeque;

use serde_json::{Map, Value};
use tracing::warn;

use crate::backend::Backend;
use crate::config::{format_duration_secs, parse_duration_value, parse_max_versions};
use crate::data::custom_metadata_value;
use crate::request::{Operation, Request, Response};
use crate::storage::Storage;
use crate::types::{seconds_duration, timestamp_string, KeyMetadata};
use crate::{Error, Result};

const MAX_CUSTOM_METADATA_KEYS: usize = 64;
const MAX_CUSTOM_METADATA_KEY_LEN: usize = 128;
const MAX_CUSTOM_METADATA_VALUE_LEN: usize = 512;

pub(crate) fn handle(backend: &Backend, req: &Request, key: &str) -> Result<Option<Response>> {
    match req.operation {
        Operation::Read => read(backend, req, key),
        Operation::Create | Operation::Update => write(backend, req, key),
        Operation::Patch => patch(backend, req, key),
        Operation::Delete => delete(backend, req, key),
        Operation::List => list(backend, req, key),
    }
}

pub(crate) fn handle_recursive(
    backend: &Backend,
    req: &Request,
    key: &str,
) -> Result<Option<Response>> {
    if req.operation != Operation::List {
        return Err(Error::Unsupported(format!(
            "operation not supported on recursive metadata: {:?}",
            req.operation
        )));
    }
    list_recursive(backend, req, key)
}

fn read(backend: &Backend, req: &Request, key: &str) -> Result<Option<Response>> {
    let Some(meta) = backend.get_key_metadata(req.storage.as_ref(), key)? else {
        return Ok(None);
    };

    let mut versions = Map::new();
    for (number, vm) in &meta.versions {
        let mut entry = Map::new();
        entry.insert(
            "created_time".to_string(),
            Value::from(timestamp_string(vm.created_time.as_ref())),
        );
        entry.insert(
            "deletion_time".to_string(),
            Value::from(timestamp_string(vm.deletion_time.as_ref())),
        );
        entry.insert("destroyed".to_string(), Value::from(vm.destroyed));
        versions.insert(number.to_string(), Value::Object(entry));
    }

    let mut data = Map::new();
    data.insert("versions".to_string(), Value::Object(versions));
    data.insert(
        "current_version".to_string(),
        Value::from(meta.current_version),
    );
    data.insert(
        "oldest_version".to_string(),
        Value::from(meta.oldest_version),
    );
    data.insert(
        "created_time".to_string(),
        Value::from(timestamp_string(meta.created_time.as_ref())),
    );
    data.insert(
        "updated_time".to_string(),
        Value::from(timestamp_string(meta.updated_time.as_ref())),
    );
    data.insert("max_versions".to_string(), Value::from(meta.max_versions));
    data.insert("cas_required".to_string(), Value::from(meta.cas_required));
    data.insert(
        "delete_version_after".to_string(),
        Value::from(format_duration_secs(meta.delete_version_after_secs())),
    );
    data.insert(
        "custom_metadata".to_string(),
        custom_metadata_value(&meta),
    );

    Ok(Some(Response::new(data)))
}

/// Parsed policy fields of a metadata write or patch; each is present only
/// when the request carried it.
struct PolicyFields {
    max_versions: Option<u32>,
    cas_required: Option<bool>,
    delete_version_after: Option<i64>,
    custom_metadata: Option<Map<String, Value>>,
    clear: bool,
}

impl PolicyFields {
    fn parse(req: &Request, allow_null_values: bool) -> Result<Self> {
        let max_versions = req
            .data
            .get("max_versions")
            .map(parse_max_versions)
            .transpose()?;
        let cas_required = match req.data.get("cas_required") {
            None => None,
            Some(Value::Bool(b)) => Some(*b),
            Some(_) => {
                return Err(Error::InvalidRequest(
                    "cas_required must be a boolean".to_string(),
                ))
            },
        };
        let delete_version_after = req
            .data
            .get("delete_version_after")
            .map(parse_duration_value)
            .transpose()?;
        let custom_metadata = match req.data.get("custom_metadata") {
            None => None,
            Some(Value::Object(map)) => {
                validate_custom_metadata(map, allow_null_values)?;
                Some(map.clone())
            },
            Some(_) => {
                return Err(Error::InvalidRequest(
                    "custom_metadata must be a map of string keys to string values".to_string(),
                ))
            },
        };
        let clear = req
            .data
            .get("clear")
            .map(|v| {
                v.as_bool().ok_or_else(|| {
                    Error::InvalidRequest("clear must be a boolean".to_string())
                })
            })
            .transpose()?
            .unwrap_or(false);

        Ok(Self {
            max_versions,
            cas_required,
            delete_version_after,
            custom_metadata,
            clear,
        })
    }

    fn is_empty(&self) -> bool {
        self.max_versions.is_none()
            && self.cas_required.is_none()
            && self.delete_version_after.is_none()
            && self.custom_metadata.is_none()
            && !self.clear
    }

    /// Apply the present fields to the record. Custom metadata handling
    /// differs between write (replace) and patch (merge with null removal),
    /// so it stays with the callers.
    fn apply_policy(&self, meta: &mut KeyMetadata) {
        if self.clear {
            meta.max_versions = 0;
            meta.cas_required = false;
            meta.delete_version_after = None;
            meta.custom_metadata.clear();
        }
        if let Some(max_versions) = self.max_versions {
            meta.max_versions = max_versions;
        }
        if let Some(cas_required) = self.cas_required {
            meta.cas_required = cas_required;
        }
        if let Some(seconds) = self.delete_version_after {
            meta.delete_version_after = match seconds {
                0 => None,
                s if s < 0 => Some(seconds_duration(-1)),
                s => Some(seconds_duration(s)),
            };
        }
    }

    /// Config-level validation shared by write and patch. Returns the
    /// warnings to attach to the response.
    fn check_against_config(&self, backend: &Backend, storage: &dyn Storage) -> Result<Vec<String>> {
        let config = backend.config(storage)?;
        let mut warnings = Vec::new();

        if let Some(max_versions) = self.max_versions {
            if config.max_versions > 0 && max_versions > config.max_versions {
                return Err(Error::InvalidRequest(
                    "cannot set max_versions higher than the backend configuration".to_string(),
                ));
            }
        }
        if self.cas_required == Some(false) && config.cas_required {
            warnings.push(
                "check-and-set is mandated by the backend configuration and remains required"
                    .to_string(),
            );
        }

        Ok(warnings)
    }
}

fn write(backend: &Backend, req: &Request, key: &str) -> Result<Option<Response>> {
    let fields = PolicyFields::parse(req, false)?;
    if fields.is_empty() {
        return Ok(None);
    }

    let storage = req.storage.as_ref();
    let warnings = fields.check_against_config(backend, storage)?;

    let lock = backend.locks.for_key(key);
    let _guard = lock.write();

    let mut meta = backend
        .get_key_metadata(storage, key)?
        .unwrap_or_else(|| KeyMetadata::new(key));

    fields.apply_policy(&mut meta);
    if let Some(custom) = &fields.custom_metadata {
        meta.custom_metadata = custom
            .iter()
            .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
            .collect();
    }

    backend.write_key_metadata(storage, &meta)?;
    Ok(warnings_response(warnings))
}

fn patch(backend: &Backend, req: &Request, key: &str) -> Result<Option<Response>> {
    let fields = PolicyFields::parse(req, true)?;

    let storage = req.storage.as_ref();
    let warnings = fields.check_against_config(backend, storage)?;

    let lock = backend.locks.for_key(key);
    let _guard = lock.write();

    let Some(mut meta) = backend.get_key_metadata(storage, key)? else {
        return Ok(Some(Response::not_found(Map::new())));
    };

    if fields.is_empty() {
        return Ok(warnings_response(warnings));
    }

    fields.apply_policy(&mut meta);
    if let Some(custom) = &fields.custom_metadata {
        for (name, value) in custom {
            match value {
                Value::Null => {
                    meta.custom_metadata.remove(name);
                },
                Value::String(s) => {
                    meta.custom_metadata.insert(name.clone(), s.clone());
                },
                // Non-string values were rejected during validation.
                _ => {},
            }
        }
    }

    backend.write_key_metadata(storage, &meta)?;
    Ok(warnings_response(warnings))
}

fn delete(backend: &Backend, req: &Request, key: &str) -> Result<Option<Response>> {
    let storage = req.storage.as_ref();

    let lock = backend.locks.for_key(key);
    let _guard = lock.write();

    let Some(meta) = backend.get_key_metadata(storage, key)? else {
        return Ok(None);
    };

    // Every version blob goes, best effort, then the metadata record itself.
    let mut warnings = Vec::new();
    for version in meta.versions.keys() {
        let path = backend.version_path(storage, key, *version)?;
        if let Err(e) = storage.delete(&path) {
            warn!(key, version, error = %e, "failed to delete version blob");
            warnings.push(format!("failed to delete version {version}: {e}"));
        }
    }

    backend.delete_key_metadata(storage, key)?;
    Ok(warnings_response(warnings))
}

fn list(backend: &Backend, req: &Request, key: &str) -> Result<Option<Response>> {
    let storage = req.storage.as_ref();
    let es = backend.encrypted_metadata(storage)?;
    let names = es.list(storage, key)?;

    let exclude_deleted = req
        .data
        .get("exclude_deleted")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !exclude_deleted {
        return Ok(Some(Response::list(names)));
    }

    let base = directory_base(key);
    let mut kept = Vec::with_capacity(names.len());
    for name in names {
        // Directory markers are always included.
        if !name.ends_with('/') && current_version_deleted(backend, storage, &format!("{base}{name}"))? {
            continue;
        }
        kept.push(name);
    }
    Ok(Some(Response::list(kept)))
}

fn list_recursive(backend: &Backend, req: &Request, key: &str) -> Result<Option<Response>> {
    let storage = req.storage.as_ref();
    let es = backend.encrypted_metadata(storage)?;

    let exclude_deleted = req
        .data
        .get("exclude_deleted")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let base = directory_base(key);
    let mut results = Vec::new();
    let mut queue = VecDeque::from([String::new()]);

    while let Some(dir) = queue.pop_front() {
        for name in es.list(storage, &format!("{base}{dir}"))? {
            let relative = format!("{dir}{name}");
            if name.ends_with('/') {
                results.push(relative.clone());
                queue.push_back(relative);
            } else {
                if exclude_deleted
                    && current_version_deleted(backend, storage, &format!("{base}{relative}"))?
                {
                    continue;
                }
                results.push(relative);
            }
        }
    }

    results.sort();
    Ok(Some(Response::list(results)))
}

/// Normalize a listing key to a directory base: empty stays empty, anything
/// else gets a trailing `/`.
fn directory_base(key: &str) -> String {
    if key.is_empty() || key.ends_with('/') {
        key.to_string()
    } else {
        format!("{key}/")
    }
}

/// True when the key's current version is in the deleted state. A destroyed
/// current version without a deletion time does not count.
fn current_version_deleted(
    backend: &Backend,
    storage: &dyn Storage,
    key: &str,
) -> Result<bool> {
    let Some(meta) = backend.get_key_metadata(storage, key)? else {
        return Ok(false);
    };
    Ok(meta
        .versions
        .get(&meta.current_version)
        .is_some_and(|vm| vm.is_deleted()))
}

fn warnings_response(warnings: Vec<String>) -> Option<Response> {
    if warnings.is_empty() {
        return None;
    }
    let mut resp = Response::new(Map::new());
    for warning in warnings {
        resp.add_warning(warning);
    }
    Some(resp)
}

fn validate_custom_metadata(map: &Map<String, Value>, allow_null_values: bool) -> Result<()> {
    let mut problems = Vec::new();

    if map.len() > MAX_CUSTOM_METADATA_KEYS {
        problems.push(format!(
            "custom_metadata may contain at most {MAX_CUSTOM_METADATA_KEYS} keys, got {}",
            map.len()
        ));
    }

    for (name, value) in map {
        if name.is_empty() || name.len() > MAX_CUSTOM_METADATA_KEY_LEN {
            problems.push(format!(
                "custom_metadata key {name:?} must be 1-{MAX_CUSTOM_METADATA_KEY_LEN} characters"
            ));
        }
        if name.chars().any(char::is_control) {
            problems.push(format!(
                "custom_metadata key {name:?} contains unprintable characters"
            ));
        }

        match value {
            Value::String(s) => {
                if s.is_empty() || s.len() > MAX_CUSTOM_METADATA_VALUE_LEN {
                    problems.push(format!(
                        "custom_metadata value for {name:?} must be \
                         1-{MAX_CUSTOM_METADATA_VALUE_LEN} characters"
                    ));
                }
                if s.chars().any(char::is_control) {
                    problems.push(format!(
                        "custom_metadata value for {name:?} contains unprintable characters"
                    ));
                }
            },
            Value::Null if allow_null_values => {},
            _ => {
                problems.push(format!(
                    "custom_metadata value for {name:?} must be a string"
                ));
            },
        }
    }

    if problems.is_empty() {
        return Ok(());
    }
    Err(Error::InvalidRequest(format!(
        "{} error(s) occurred:\n\t* {}",
        problems.len(),
        problems.join("\n\t* ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendConfig;
    use crate::storage::MemoryStorage;
    use std::sync::Arc;

    fn setup() -> (Arc<Backend>, Arc<dyn Storage>) {
        let backend = Backend::factory(BackendConfig {
            backend_uuid: "meta-test".to_string(),
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

    fn write_data(backend: &Backend, storage: &Arc<dyn Storage>, key: &str, body: Value) {
        run(
            backend,
            storage,
            Operation::Create,
            &format!("data/{key}"),
            serde_json::json!({"data": body}),
        )
        .unwrap()
        .unwrap();
    }

    #[test]
    fn test_read_reports_versions_and_policy() {
        let (backend, storage) = setup();
        write_data(&backend, &storage, "foo", serde_json::json!({"a": 1}));
        write_data(&backend, &storage, "foo", serde_json::json!({"a": 2}));

        let resp = run(&backend, &storage, Operation::Read, "metadata/foo", serde_json::json!({}))
            .unwrap()
            .unwrap();
        assert_eq!(resp.data.get("current_version"), Some(&Value::from(2u64)));
        assert_eq!(resp.data.get("oldest_version"), Some(&Value::from(0u64)));
        assert_eq!(resp.data.get("max_versions"), Some(&Value::from(0u32)));
        assert_eq!(
            resp.data.get("delete_version_after"),
            Some(&Value::from("0s"))
        );

        let versions = resp.data.get("versions").unwrap().as_object().unwrap();
        assert_eq!(versions.len(), 2);
        assert!(versions.contains_key("1"));
        assert!(versions.contains_key("2"));
    }

    #[test]
    fn test_read_missing_key_is_empty() {
        let (backend, storage) = setup();
        let resp = run(&backend, &storage, Operation::Read, "metadata/none", serde_json::json!({}))
            .unwrap();
        assert!(resp.is_none());
    }

    #[test]
    fn test_write_merges_present_fields() {
        let (backend, storage) = setup();

        run(
            &backend,
            &storage,
            Operation::Create,
            "metadata/foo",
            serde_json::json!({"max_versions": 3}),
        )
        .unwrap();
        run(
            &backend,
            &storage,
            Operation::Update,
            "metadata/foo",
            serde_json::json!({"cas_required": true}),
        )
        .unwrap();

        let meta = backend
            .get_key_metadata(storage.as_ref(), "foo")
            .unwrap()
            .unwrap();
        assert_eq!(meta.max_versions, 3);
        assert!(meta.cas_required);
    }

    #[test]
    fn test_write_clear_resets_policy() {
        let (backend, storage) = setup();
        run(
            &backend,
            &storage,
            Operation::Create,
            "metadata/foo",
            serde_json::json!({
                "max_versions": 3,
                "custom_metadata": {"team": "infra"}
            }),
        )
        .unwrap();

        run(
            &backend,
            &storage,
            Operation::Update,
            "metadata/foo",
            serde_json::json!({"clear": true, "cas_required": true}),
        )
        .unwrap();

        let meta = backend
            .get_key_metadata(storage.as_ref(), "foo")
            .unwrap()
            .unwrap();
        assert_eq!(meta.max_versions, 0);
        assert!(meta.cas_required);
        assert!(meta.custom_metadata.is_empty());
    }

    #[test]
    fn test_write_max_versions_capped_by_config() {
        let (backend, storage) = setup();
        run(
            &backend,
            &storage,
            Operation::Update,
            "config",
            serde_json::json!({"max_versions": 5}),
        )
        .unwrap();

        let err = run(
            &backend,
            &storage,
            Operation::Create,
            "metadata/foo",
            serde_json::json!({"max_versions": 6}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_versions"));
    }

    #[test]
    fn test_write_cas_false_under_config_warns() {
        let (backend, storage) = setup();
        run(
            &backend,
            &storage,
            Operation::Update,
            "config",
            serde_json::json!({"cas_required": true}),
        )
        .unwrap();

        let resp = run(
            &backend,
            &storage,
            Operation::Create,
            "metadata/foo",
            serde_json::json!({"cas_required": false}),
        )
        .unwrap()
        .unwrap();
        assert_eq!(resp.warnings.len(), 1);

        // The field is stored, but the config still mandates CAS.
        let err = run(
            &backend,
            &storage,
            Operation::Create,
            "data/foo",
            serde_json::json!({"data": {"a": 1}}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("check-and-set parameter required"));
    }

    #[test]
    fn test_patch_missing_key_404() {
        let (backend, storage) = setup();
        let resp = run(
            &backend,
            &storage,
            Operation::Patch,
            "metadata/none",
            serde_json::json!({"max_versions": 2}),
        )
        .unwrap()
        .unwrap();
        assert_eq!(resp.status, Some(404));
    }

    #[test]
    fn test_patch_custom_metadata_null_removes() {
        let (backend, storage) = setup();
        run(
            &backend,
            &storage,
            Operation::Create,
            "metadata/foo",
            serde_json::json!({"custom_metadata": {"keep": "1", "drop": "2"}}),
        )
        .unwrap();

        run(
            &backend,
            &storage,
            Operation::Patch,
            "metadata/foo",
            serde_json::json!({"custom_metadata": {"drop": null, "new": "3"}}),
        )
        .unwrap();

        let meta = backend
            .get_key_metadata(storage.as_ref(), "foo")
            .unwrap()
            .unwrap();
        assert_eq!(meta.custom_metadata.len(), 2);
        assert_eq!(meta.custom_metadata.get("keep"), Some(&"1".to_string()));
        assert_eq!(meta.custom_metadata.get("new"), Some(&"3".to_string()));
        assert!(!meta.custom_metadata.contains_key("drop"));
    }

    #[test]
    fn test_custom_metadata_validation_aggregates() {
        let (backend, storage) = setup();

        let err = run(
            &backend,
            &storage,
            Operation::Create,
            "metadata/foo",
            serde_json::json!({"custom_metadata": {
                "": "empty-key",
                "bad-value": 7,
                "bad-chars": "a\u{0007}b"
            }}),
        )
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("3 error(s) occurred"));
        assert!(message.contains("unprintable"));
        assert!(message.contains("must be a string"));
    }

    #[test]
    fn test_custom_metadata_key_count_capped() {
        let (backend, storage) = setup();

        let mut custom = Map::new();
        for i in 0..65 {
            custom.insert(format!("k{i}"), Value::from("v"));
        }
        let err = run(
            &backend,
            &storage,
            Operation::Create,
            "metadata/foo",
            serde_json::json!({"custom_metadata": custom}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("at most 64 keys"));
    }

    #[test]
    fn test_delete_cascades_to_version_blobs() {
        let (backend, storage) = setup();
        write_data(&backend, &storage, "foo", serde_json::json!({"a": 1}));
        write_data(&backend, &storage, "foo", serde_json::json!({"a": 2}));

        let blob_path = backend.version_path(storage.as_ref(), "foo", 1).unwrap();
        assert!(storage.get(&blob_path).unwrap().is_some());

        run(&backend, &storage, Operation::Delete, "metadata/foo", serde_json::json!({}))
            .unwrap();

        assert!(storage.get(&blob_path).unwrap().is_none());
        assert!(backend
            .get_key_metadata(storage.as_ref(), "foo")
            .unwrap()
            .is_none());

        let read = run(&backend, &storage, Operation::Read, "data/foo", serde_json::json!({}))
            .unwrap();
        assert!(read.is_none());
    }

    #[test]
    fn test_list_returns_sorted_names_with_markers() {
        let (backend, storage) = setup();
        write_data(&backend, &storage, "b", serde_json::json!({"x": 1}));
        write_data(&backend, &storage, "a/nested", serde_json::json!({"x": 1}));
        write_data(&backend, &storage, "a/other", serde_json::json!({"x": 1}));

        let resp = run(&backend, &storage, Operation::List, "metadata/", serde_json::json!({}))
            .unwrap()
            .unwrap();
        assert_eq!(
            resp.data.get("keys"),
            Some(&serde_json::json!(["a/", "b"]))
        );

        let resp = run(&backend, &storage, Operation::List, "metadata/a/", serde_json::json!({}))
            .unwrap()
            .unwrap();
        assert_eq!(
            resp.data.get("keys"),
            Some(&serde_json::json!(["nested", "other"]))
        );
    }

    #[test]
    fn test_list_exclude_deleted() {
        let (backend, storage) = setup();
        write_data(&backend, &storage, "live", serde_json::json!({"x": 1}));
        write_data(&backend, &storage, "gone", serde_json::json!({"x": 1}));
        run(&backend, &storage, Operation::Delete, "data/gone", serde_json::json!({}))
            .unwrap();

        let resp = run(
            &backend,
            &storage,
            Operation::List,
            "metadata/",
            serde_json::json!({"exclude_deleted": true}),
        )
        .unwrap()
        .unwrap();
        assert_eq!(resp.data.get("keys"), Some(&serde_json::json!(["live"])));

        // Destroyed-only keys stay listed.
        run(
            &backend,
            &storage,
            Operation::Update,
            "destroy/live",
            serde_json::json!({"versions": [1]}),
        )
        .unwrap();
        let resp = run(
            &backend,
            &storage,
            Operation::List,
            "metadata/",
            serde_json::json!({"exclude_deleted": true}),
        )
        .unwrap()
        .unwrap();
        assert_eq!(resp.data.get("keys"), Some(&serde_json::json!(["live"])));
    }

    #[test]
    fn test_recursive_list_flattens_tree() {
        let (backend, storage) = setup();
        write_data(&backend, &storage, "top", serde_json::json!({"x": 1}));
        write_data(&backend, &storage, "a/b/c", serde_json::json!({"x": 1}));
        write_data(&backend, &storage, "a/leaf", serde_json::json!({"x": 1}));

        let resp = run(
            &backend,
            &storage,
            Operation::List,
            "metadata-recursive/",
            serde_json::json!({}),
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            resp.data.get("keys"),
            Some(&serde_json::json!(["a/", "a/b/", "a/b/c", "a/leaf", "top"]))
        );
    }

    #[test]
    fn test_recursive_list_scoped() {
        let (backend, storage) = setup();
        write_data(&backend, &storage, "a/b/c", serde_json::json!({"x": 1}));
        write_data(&backend, &storage, "other", serde_json::json!({"x": 1}));

        let resp = run(
            &backend,
            &storage,
            Operation::List,
            "metadata-recursive/a/",
            serde_json::json!({}),
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            resp.data.get("keys"),
            Some(&serde_json::json!(["b/", "b/c"]))
        );
    }
}
