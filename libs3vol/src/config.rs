//! Driver configuration.
//!
//! [`DriverConfig`] gathers everything the lifecycle manager needs besides
//! its collaborators.  The `s3vol` binary fills it from command-line flags
//! and `S3VOL_*` environment variables; tests build it directly.

use std::fmt;
use std::path::PathBuf;

use crate::lock::LockConfig;
use crate::mount::HelperConfig;
use crate::options;
use crate::types::MountOptions;

/// Default name of the bucket holding the registry object.
pub const DEFAULT_CONFIG_BUCKET: &str = "s3vol";

/// Default region passed when creating buckets.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Default directory under which volumes are mounted.
pub const DEFAULT_ROOT_MOUNT: &str = "/mnt";

/// Settings of an [`S3Driver`](crate::driver::S3Driver).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Bucket holding the `volumes` registry object.
    pub config_bucket: String,
    /// Region used for every bucket the driver creates.
    pub region: String,
    /// Volumes are mounted at `<root_mount>/<name>`.
    pub root_mount: PathBuf,
    /// Derive bucket names by turning `_` into `-` (S3 rejects `_`).
    pub replace_underscores: bool,
    /// Mount options applied under every volume's own options.
    pub defaults: MountOptions,
    pub lock: LockConfig,
    pub helper: HelperConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            config_bucket: DEFAULT_CONFIG_BUCKET.to_owned(),
            region: DEFAULT_REGION.to_owned(),
            root_mount: PathBuf::from(DEFAULT_ROOT_MOUNT),
            replace_underscores: false,
            defaults: MountOptions::new(),
            lock: LockConfig::default(),
            helper: HelperConfig::default(),
        }
    }
}

impl DriverConfig {
    /// Bucket backing volume `name`.
    pub fn bucket_for(&self, name: &str) -> String {
        if self.replace_underscores {
            name.replace('_', "-")
        } else {
            name.to_owned()
        }
    }
}

impl fmt::Display for DriverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config_bucket={} region={} root_mount={} replace_underscores={} defaults=[{}] identity={}",
            self.config_bucket,
            self.region,
            self.root_mount.display(),
            self.replace_underscores,
            options::serialize(&self.defaults),
            self.lock.identity,
        )
    }
}
