// SPDX-License-Identifier: MIT OR Apache-2.0
//! Backend-wide configuration handlers.

use serde_json::Value;

use crate::backend::Backend;
use crate::request::{Operation, Request, Response};
use crate::types::{seconds_duration, Configuration};
use crate::{Error, Result};

pub(crate) fn handle(backend: &Backend, req: &Request) -> Result<Option<Response>> {
    match req.operation {
        Operation::Read => read(backend, req),
        Operation::Create | Operation::Update => write(backend, req),
        _ => Err(Error::Unsupported(format!(
            "operation not supported on config: {:?}",
            req.operation
        ))),
    }
}

fn read(backend: &Backend, req: &Request) -> Result<Option<Response>> {
    let config = backend.config(req.storage.as_ref())?;

    let mut data = serde_json::Map::new();
    data.insert(
        "max_versions".to_string(),
        Value::from(config.max_versions),
    );
    data.insert(
        "cas_required".to_string(),
        Value::from(config.cas_required),
    );
    data.insert(
        "delete_version_after".to_string(),
        Value::from(format_duration_secs(config.delete_version_after_secs())),
    );

    Ok(Some(Response::new(data)))
}

fn write(backend: &Backend, req: &Request) -> Result<Option<Response>> {
    let max_versions = req.data.get("max_versions");
    let cas_required = req.data.get("cas_required");
    let delete_after = req.data.get("delete_version_after");

    // Fast path: nothing to apply.
    if max_versions.is_none() && cas_required.is_none() && delete_after.is_none() {
        return Ok(None);
    }

    let mut config: Configuration = backend.config(req.storage.as_ref())?.as_ref().clone();

    if let Some(value) = max_versions {
        config.max_versions = parse_max_versions(value)?;
    }
    if let Some(value) = cas_required {
        config.cas_required = value
            .as_bool()
            .ok_or_else(|| Error::InvalidRequest("cas_required must be a boolean".to_string()))?;
    }
    if let Some(value) = delete_after {
        let seconds = parse_duration_value(value)?;
        // "0s" clears the schedule; negative values disable it outright.
        config.delete_version_after = match seconds {
            0 => None,
            s if s < 0 => Some(seconds_duration(-1)),
            s => Some(seconds_duration(s)),
        };
    }

    backend.set_config(req.storage.as_ref(), config)?;
    Ok(None)
}

pub(crate) fn parse_max_versions(value: &Value) -> Result<u32> {
    value
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| {
            Error::InvalidRequest("max_versions must be an unsigned 32-bit integer".to_string())
        })
}

/// Parse a duration field: a JSON integer is whole seconds, a string uses
/// duration syntax (`"30s"`, `"1h30m"`, `"2d"`, `"-1s"`, bare seconds).
pub(crate) fn parse_duration_value(value: &Value) -> Result<i64> {
    match value {
        Value::Number(n) => n.as_i64().ok_or_else(|| {
            Error::InvalidRequest("duration must be an integer number of seconds".to_string())
        }),
        Value::String(s) => parse_duration_string(s),
        _ => Err(Error::InvalidRequest(
            "duration must be a string or an integer number of seconds".to_string(),
        )),
    }
}

pub(crate) fn parse_duration_string(input: &str) -> Result<i64> {
    let input = input.trim();
    let (negative, rest) = match input.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, input),
    };
    if rest.is_empty() {
        return Err(Error::InvalidRequest(format!(
            "invalid duration: {input:?}"
        )));
    }

    // A bare integer is a number of seconds.
    if rest.chars().all(|c| c.is_ascii_digit()) {
        let seconds: i64 = rest
            .parse()
            .map_err(|_| Error::InvalidRequest(format!("invalid duration: {input:?}")))?;
        return Ok(if negative { -seconds } else { seconds });
    }

    // Compound segments: "1h30m", "2d", "45s".
    let mut total: i64 = 0;
    let mut number = String::new();
    for c in rest.chars() {
        if c.is_ascii_digit() {
            number.push(c);
            continue;
        }
        if number.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "invalid duration: {input:?}"
            )));
        }
        let amount: i64 = number
            .parse()
            .map_err(|_| Error::InvalidRequest(format!("invalid duration: {input:?}")))?;
        let unit: i64 = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86400,
            _ => {
                return Err(Error::InvalidRequest(format!(
                    "invalid duration unit {c:?} in {input:?}"
                )))
            },
        };
        total += amount * unit;
        number.clear();
    }
    if !number.is_empty() {
        return Err(Error::InvalidRequest(format!(
            "invalid duration: {input:?} (missing unit)"
        )));
    }

    Ok(if negative { -total } else { total })
}

/// Render whole seconds back to the duration syntax used in responses.
pub(crate) fn format_duration_secs(seconds: i64) -> String {
    format!("{seconds}s")
}
