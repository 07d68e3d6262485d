// SPDX-License-Identifier: MIT OR Apache-2.0
//! Persistent record types and version lifecycle arithmetic.
//!
//! Everything written to storage uses the protobuf wire format with stable
//! field tags so records stay forward-compatible across releases. Timestamps
//! are `(seconds, nanos)` UTC; durations may be negative (the "disabled"
//! sentinel for scheduled deletion).

use std::collections::HashMap;

use prost_types::{Duration, Timestamp};

/// Number of versions to keep when neither the key metadata nor the backend
/// configuration sets a limit.
pub(crate) const DEFAULT_MAX_VERSIONS: u32 = 10;

/// Backend-wide defaults applied to every key without an override.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Configuration {
    #[prost(uint32, tag = "1")]
    pub max_versions: u32,
    #[prost(bool, tag = "2")]
    pub cas_required: bool,
    /// Time after creation at which a version is scheduled for deletion.
    /// Absent or zero = not set; negative = disabled.
    #[prost(message, optional, tag = "3")]
    pub delete_version_after: Option<Duration>,
}

/// Per-key record tracking every version's state.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyMetadata {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(map = "uint64, message", tag = "2")]
    pub versions: HashMap<u64, VersionMetadata>,
    /// Highest version number ever created. Never decreases.
    #[prost(uint64, tag = "3")]
    pub current_version: u64,
    /// Lowest version number still tracked in `versions`. Starts at 0 and
    /// only moves forward when retention trims.
    #[prost(uint64, tag = "4")]
    pub oldest_version: u64,
    #[prost(message, optional, tag = "5")]
    pub created_time: Option<Timestamp>,
    #[prost(message, optional, tag = "6")]
    pub updated_time: Option<Timestamp>,
    /// Per-key retention override; 0 inherits the backend configuration.
    #[prost(uint32, tag = "7")]
    pub max_versions: u32,
    /// Per-key CAS override; the effective requirement is `this OR config`.
    #[prost(bool, tag = "8")]
    pub cas_required: bool,
    #[prost(message, optional, tag = "9")]
    pub delete_version_after: Option<Duration>,
    #[prost(map = "string, string", tag = "10")]
    pub custom_metadata: HashMap<String, String>,
}

/// State of a single version.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VersionMetadata {
    #[prost(message, optional, tag = "1")]
    pub created_time: Option<Timestamp>,
    /// Nil while live. Set by an explicit delete or by the archival schedule;
    /// readers treat a past value as a tombstone either way.
    #[prost(message, optional, tag = "2")]
    pub deletion_time: Option<Timestamp>,
    /// Terminal once true.
    #[prost(bool, tag = "3")]
    pub destroyed: bool,
}

/// Immutable version payload: the caller's JSON document as raw bytes.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Version {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub created_time: Option<Timestamp>,
}

/// Canary record present at `<prefix>/upgrading` while an upgrade runs.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpgradeInfo {
    #[prost(message, optional, tag = "1")]
    pub started_time: Option<Timestamp>,
}

/// Persisted root key for metadata path encryption.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PolicyRecord {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(bytes = "vec", tag = "2")]
    pub key: Vec<u8>,
    #[prost(message, optional, tag = "3")]
    pub created_time: Option<Timestamp>,
}

impl Configuration {
    /// Signed seconds of the configured deletion schedule; 0 when unset.
    pub fn delete_version_after_secs(&self) -> i64 {
        duration_secs(self.delete_version_after.as_ref())
    }
}

impl KeyMetadata {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    pub fn delete_version_after_secs(&self) -> i64 {
        duration_secs(self.delete_version_after.as_ref())
    }

    /// Record a new version and trim retention.
    ///
    /// Bumps `current_version`, inserts the version metadata, updates the
    /// record timestamps, then removes every version in
    /// `[oldest_version, current_version - effective_max]` so the retained
    /// count stays within the effective max-versions policy even when the
    /// policy was lowered between writes. Returns the version numbers that
    /// were trimmed; the caller is responsible for deleting their payload
    /// blobs.
    pub fn add_version(
        &mut self,
        created_time: Timestamp,
        deletion_time: Option<Timestamp>,
        config_max_versions: u32,
    ) -> Vec<u64> {
        self.current_version += 1;
        self.versions.insert(
            self.current_version,
            VersionMetadata {
                created_time: Some(created_time.clone()),
                deletion_time,
                destroyed: false,
            },
        );

        self.updated_time = Some(created_time.clone());
        if self.created_time.is_none() {
            self.created_time = Some(created_time);
        }

        let max_versions = if self.max_versions != 0 {
            self.max_versions
        } else if config_max_versions > 0 {
            config_max_versions
        } else {
            DEFAULT_MAX_VERSIONS
        };

        let mut removed = Vec::new();
        if self.current_version - self.oldest_version >= u64::from(max_versions) {
            let trim_to = self.current_version - u64::from(max_versions);
            for version in self.oldest_version..=trim_to {
                if self.versions.remove(&version).is_some() {
                    removed.push(version);
                }
            }
            self.oldest_version = trim_to + 1;
        }

        removed
    }
}

impl VersionMetadata {
    /// True when the version has a deletion time in the past. Scheduled
    /// archival and explicit deletes both land here.
    pub fn is_deleted(&self) -> bool {
        self.deletion_time.as_ref().is_some_and(timestamp_passed)
    }
}

/// Current wall-clock time as a protobuf timestamp.
pub fn timestamp_now() -> Timestamp {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    Timestamp {
        seconds: now.as_secs() as i64,
        nanos: now.subsec_nanos() as i32,
    }
}

/// True when `ts` is at or before the current wall clock.
pub fn timestamp_passed(ts: &Timestamp) -> bool {
    let now = timestamp_now();
    (ts.seconds, ts.nanos) <= (now.seconds, now.nanos)
}

/// RFC 3339 rendering for responses; empty string when absent.
pub fn timestamp_string(ts: Option<&Timestamp>) -> String {
    ts.and_then(|t| chrono::DateTime::from_timestamp(t.seconds, t.nanos.max(0) as u32))
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_default()
}

/// Signed seconds of an optional duration; 0 when absent.
pub fn duration_secs(duration: Option<&Duration>) -> i64 {
    duration.map_or(0, |d| d.seconds)
}

/// A duration of whole seconds.
pub fn seconds_duration(seconds: i64) -> Duration {
    Duration { seconds, nanos: 0 }
}

/// Compute the scheduled deletion time for a version created at `created`.
///
/// The per-key setting wins whenever it is non-zero; otherwise the backend
/// configuration applies. A negative value at either level disables the
/// schedule; zero means not set.
pub fn scheduled_deletion_time(
    created: &Timestamp,
    meta_secs: i64,
    config_secs: i64,
) -> Option<Timestamp> {
    let effective = if meta_secs != 0 { meta_secs } else { config_secs };
    if effective <= 0 {
        return None;
    }
    Some(Timestamp {
        seconds: created.seconds + effective,
        nanos: created.nanos,
    })
}
