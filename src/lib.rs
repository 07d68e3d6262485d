// SPDX-License-Identifier: MIT OR Apache-2.0
//! Versioned key/value secrets engine.
//!
//! Secrets are stored as an append-only history of immutable versions per
//! logical key. Each key carries a metadata record tracking every version's
//! state (live, deleted, destroyed), retention is bounded by a max-versions
//! policy, and writes can be guarded with check-and-set. Metadata paths are
//! convergently encrypted so storage listings disclose only obfuscated names,
//! and version payloads live under salted hash paths.
//!
//! Storage features:
//! - Monotonic version numbering with retention trimming
//! - Soft delete with undelete, hard destroy, TTL-driven archival
//! - Check-and-set write concurrency control
//! - AES-256-GCM convergent encryption of metadata path components
//! - 256-stripe per-key lock pool for serialized metadata updates
//! - Online upgrade from a flat non-versioned layout behind an atomic gate

mod backend;
mod config;
mod data;
mod delete;
mod destroy;
mod encrypted;
mod locks;
mod meta;
mod policy;
mod request;
mod salt;
mod storage;
mod subkeys;
mod types;
mod upgrade;

use thiserror::Error;

pub use backend::{Backend, BackendConfig};
pub use encrypted::EncryptedKeyStorage;
pub use locks::{LockPool, LOCK_COUNT};
pub use policy::KeyPolicy;
pub use request::{Operation, Request, Response};
pub use salt::{Salt, SALT_LEN};
pub use storage::{collect_keys, MemoryStorage, Storage, StorageEntry};
pub use types::{Configuration, KeyMetadata, UpgradeInfo, Version, VersionMetadata};

/// Error types for backend operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The request was malformed: missing data, bad CAS, invalid options.
    /// The message is user-visible; no state was changed.
    #[error("{0}")]
    InvalidRequest(String),

    /// The backend is converting non-versioned data and cannot serve traffic.
    #[error(
        "Upgrading from non-versioned to versioned data. This backend will \
         be unavailable for a brief period and will resume service shortly."
    )]
    UpgradeInProgress,

    /// The storage adapter failed; surfaced unchanged, never retried.
    #[error("storage error: {0}")]
    Storage(String),

    /// A stored record failed to deserialize.
    #[error("failed to decode {0} from storage")]
    Corrupted(&'static str),

    /// Metadata references a version whose payload blob is gone.
    #[error("could not find version")]
    VersionBlobMissing,

    /// Encryption or decryption failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// No handler for the requested path/operation pair.
    #[error("{0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, Error>;
