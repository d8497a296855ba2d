//! Core s3vol types: volume definitions, display records, and capabilities.
//!
//! These types form the data model shared by the registry, the lifecycle
//! manager and the plugin adapter.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VolError};

/// Mount options keyed by option name, iterated in ascending key order.
pub type MountOptions = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Volume definition
// ---------------------------------------------------------------------------

/// A registered volume: one record line of the registry document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeDefinition {
    /// Unique volume name (primary key of the registry).
    pub name: String,
    /// Backing bucket in the object store.
    pub bucket: String,
    /// Volume-specific mount options.
    #[serde(default)]
    pub options: MountOptions,
}

impl VolumeDefinition {
    /// Build a definition with no options.
    pub fn new(name: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bucket: bucket.into(),
            options: MountOptions::new(),
        }
    }

    /// Attach options.
    pub fn with_options(mut self, options: MountOptions) -> Self {
        self.options = options;
        self
    }

    /// Reject names and buckets that would corrupt the line-oriented
    /// registry or escape the mount root.
    pub fn validate(&self) -> Result<()> {
        validate_volume_name(&self.name)?;
        if self.bucket.is_empty() || self.bucket.contains([';', '\n', '\r']) {
            return Err(VolError::InvalidArgument(format!(
                "invalid bucket name {:?} for volume {}",
                self.bucket, self.name
            )));
        }
        if self
            .options
            .iter()
            .any(|(k, v)| k.contains(['\n', '\r', ',']) || v.contains(['\n', '\r', ',']))
        {
            return Err(VolError::InvalidArgument(format!(
                "options of volume {} contain a separator",
                self.name
            )));
        }
        Ok(())
    }
}

impl fmt::Display for VolumeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (bucket {})", self.name, self.bucket)
    }
}

/// Check that `name` can be stored as a registry key and used as a single
/// path component under the mount root.
pub fn validate_volume_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.starts_with('#')
        || name.contains([';', '/', '\n', '\r']);
    if bad {
        return Err(VolError::InvalidArgument(format!(
            "invalid volume name {name:?}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Object store listing
// ---------------------------------------------------------------------------

/// Bucket entry returned by `list_buckets`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketInfo {
    /// Bucket name.
    pub name: String,
    /// Creation timestamp reported by the store.
    pub created: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Lifecycle results
// ---------------------------------------------------------------------------

/// Display record for a volume, as returned by `list` and `get`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeInfo {
    /// Volume name.
    pub name: String,
    /// Host path where the volume is (or would be) mounted.
    pub mountpoint: String,
    /// RFC 3339 creation time of the backing bucket, empty when the bucket
    /// is unknown to the store.
    pub created_at: String,
    /// Active mounts of this volume on this host.
    #[serde(default)]
    pub mounts: u32,
}

/// Format a bucket creation time the way the plugin protocol displays it.
pub fn format_created_at(created: &DateTime<Utc>) -> String {
    created.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Scope in which a mounted volume is visible.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// One mount per host, shared by every container that references the
    /// volume name.
    Global,
    /// Mount isolated per node.
    Local,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Local => f.write_str("local"),
        }
    }
}

/// Capabilities advertised to the orchestrating protocol layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capabilities {
    /// Mount scope of the plugin.
    pub scope: Scope,
}
