// SPDX-License-Identifier: MIT OR Apache-2.0
//! Host plugin contract: requests routed to the backend and the responses it
//! returns.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::storage::Storage;

/// Operations the host router can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Read,
    Delete,
    List,
    Patch,
}

/// A single request handed to the backend by the host.
///
/// The storage view travels with the request; the backend holds no storage
/// reference of its own.
pub struct Request {
    pub operation: Operation,
    /// Full path as matched by the host router, e.g. `data/prod/db`.
    pub path: String,
    /// Request body fields, already JSON-decoded.
    pub data: Map<String, Value>,
    pub storage: Arc<dyn Storage>,
}

impl Request {
    pub fn new(operation: Operation, path: impl Into<String>, storage: Arc<dyn Storage>) -> Self {
        Self {
            operation,
            path: path.into(),
            data: Map::new(),
            storage,
        }
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }
}

/// Response envelope returned to the host.
///
/// `status` carries HTTP semantics when a handler needs to override the
/// default: a 404 response can still carry version metadata in `data`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    pub data: Map<String, Value>,
    pub status: Option<u16>,
    pub warnings: Vec<String>,
}

impl Response {
    pub fn new(data: Map<String, Value>) -> Self {
        Self {
            data,
            status: None,
            warnings: Vec::new(),
        }
    }

    /// A 404 that still carries metadata for the caller.
    pub fn not_found(data: Map<String, Value>) -> Self {
        Self {
            data,
            status: Some(404),
            warnings: Vec::new(),
        }
    }

    /// Standard list response shape: `{"keys": [...]}`.
    pub fn list(keys: Vec<String>) -> Self {
        let mut data = Map::new();
        data.insert(
            "keys".to_string(),
            Value::Array(keys.into_iter().map(Value::String).collect()),
        );
        Self::new(data)
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }
}
