// SPDX-License-Identifier: MIT OR Apache-2.0
//! Handlers for `delete/<key>` and `undelete/<key>`: soft-delete and restore
//! of listed versions.

use serde_json::Value;

use crate::backend::Backend;
use crate::request::{Operation, Request, Response};
use crate::types::timestamp_now;
use crate::{Error, Result};

pub(crate) fn handle_delete(
    backend: &Backend,
    req: &Request,
    key: &str,
) -> Result<Option<Response>> {
    toggle_deletion(backend, req, key, true)
}

pub(crate) fn handle_undelete(
    backend: &Backend,
    req: &Request,
    key: &str,
) -> Result<Option<Response>> {
    toggle_deletion(backend, req, key, false)
}

fn toggle_deletion(
    backend: &Backend,
    req: &Request,
    key: &str,
    delete: bool,
) -> Result<Option<Response>> {
    if !matches!(req.operation, Operation::Create | Operation::Update) {
        return Err(Error::Unsupported(format!(
            "operation not supported on version deletion: {:?}",
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

    let now = timestamp_now();
    let mut changed = false;
    for version in versions {
        // Destroyed and unknown versions are skipped silently.
        let Some(vm) = meta.versions.get_mut(&version) else {
            continue;
        };
        if vm.destroyed {
            continue;
        }
        vm.deletion_time = if delete { Some(now.clone()) } else { None };
        changed = true;
    }

    if changed {
        backend.write_key_metadata(storage, &meta)?;
    }
    Ok(None)
}

/// Parse the `versions` field: a list of integers, a single integer, or a
/// comma-separated string. An empty or missing list is a user error.
pub(crate) fn versions_param(req: &Request) -> Result<Vec<u64>> {
    let parsed = match req.data.get("versions") {
        Some(Value::Array(items)) => items
            .iter()
            .map(parse_version_entry)
            .collect::<Result<Vec<u64>>>()?,
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse().map_err(|_| {
                    Error::InvalidRequest(format!("invalid version number: {part:?}"))
                })
            })
            .collect::<Result<Vec<u64>>>()?,
        Some(value @ Value::Number(_)) => vec![parse_version_entry(value)?],
        None | Some(Value::Null) => Vec::new(),
        Some(_) => {
            return Err(Error::InvalidRequest(
                "versions must be a list of integers".to_string(),
            ))
        },
    };

    if parsed.is_empty() {
        return Err(Error::InvalidRequest(
            "no version number provided".to_string(),
        ));
    }
    Ok(parsed)
}

fn parse_version_entry(value: &Value) -> Result<u64> {
    match value {
        Value::Number(n) => n.as_u64().ok_or_else(|| {
            Error::InvalidRequest(format!("invalid version number: {n}"))
        }),
        Value::String(s) => s
            .parse()
            .map_err(|_| Error::InvalidRequest(format!("invalid version number: {s:?}"))),
        other => Err(Error::InvalidRequest(format!(
            "invalid version number: {other}"
        ))),
    }
}
