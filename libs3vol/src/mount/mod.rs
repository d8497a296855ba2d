//! Per-host mount reference counting.
//!
//! Every container that uses a volume sends its own mount/unmount request,
//! but the volume is attached to the host only once, at
//! `<root>/<volume name>`.  [`MountCoordinator`] keeps a refcount per volume
//! name and calls the [`MountHelper`] only on the 0 → 1 and 1 → 0
//! transitions:
//!
//! | Current count | `mount` | `unmount` |
//! |---|---|---|
//! | 0 / absent | helper mount, count = 1 | [`VolError::NotMounted`] |
//! | 1 | count = 2 | helper unmount, count = 0 |
//! | n ≥ 2 | count = n + 1 | count = n - 1 |
//!
//! A failed helper call leaves the count unchanged.  One mutex guards the
//! whole map for the decision and the helper call, so helper invocations
//! for different volumes are serialized too.  The state lives in memory
//! only and is lost on restart.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::error::{Result, VolError};
use crate::options;
use crate::types::{MountOptions, VolumeDefinition, validate_volume_name};

pub mod dry_run;
pub mod helper;

pub use dry_run::{DryRunHelper, HelperCall};
pub use helper::{CommandHelper, HelperConfig};

/// Attaches and detaches a bucket at a host path.
#[async_trait]
pub trait MountHelper: Send + Sync {
    /// Attach `bucket` at `target` with the serialized `options`.
    async fn mount(&self, bucket: &str, target: &Path, options: &str) -> Result<()>;

    /// Detach whatever is mounted at `target`.
    async fn unmount(&self, target: &Path) -> Result<()>;
}

/// Reference-counting front of a [`MountHelper`].
pub struct MountCoordinator {
    root: PathBuf,
    defaults: MountOptions,
    helper: Arc<dyn MountHelper>,
    /// Active mount requests per volume name.
    mounts: Mutex<HashMap<String, u32>>,
}

impl MountCoordinator {
    /// `defaults` are merged under every volume's own options.
    pub fn new(
        root: impl Into<PathBuf>,
        defaults: MountOptions,
        helper: Arc<dyn MountHelper>,
    ) -> Self {
        Self {
            root: root.into(),
            defaults,
            helper,
            mounts: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host path of volume `name`.
    pub fn mount_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Current refcount of `name` (0 when never mounted).
    pub async fn mount_count(&self, name: &str) -> u32 {
        self.mounts.lock().await.get(name).copied().unwrap_or(0)
    }

    /// Register one more user of `def`, mounting it if it is the first.
    #[instrument(skip(self, def), fields(volume = %def.name, bucket = %def.bucket))]
    pub async fn mount(&self, def: &VolumeDefinition) -> Result<PathBuf> {
        validate_volume_name(&def.name)?;
        let target = self.mount_path(&def.name);

        let mut mounts = self.mounts.lock().await;
        let count = mounts.get(&def.name).copied().unwrap_or(0);
        if count > 0 {
            let next = count.checked_add(1).ok_or_else(|| {
                VolError::Internal(format!("mount count overflow for {}", def.name))
            })?;
            mounts.insert(def.name.clone(), next);
            debug!(count = next, "volume already mounted, sharing");
            return Ok(target);
        }

        ensure_mount_dir(&target).await?;
        let merged = options::merge(&self.defaults, &def.options);
        let serialized = options::serialize(&merged);
        self.helper.mount(&def.bucket, &target, &serialized).await?;

        mounts.insert(def.name.clone(), 1);
        info!(path = %target.display(), options = %serialized, "volume mounted");
        Ok(target)
    }

    /// Drop one user of `name`, unmounting it if it was the last.
    #[instrument(skip(self))]
    pub async fn unmount(&self, name: &str) -> Result<()> {
        let mut mounts = self.mounts.lock().await;
        match mounts.get(name).copied().unwrap_or(0) {
            0 => Err(VolError::NotMounted(name.to_owned())),
            1 => {
                let target = self.mount_path(name);
                self.helper.unmount(&target).await?;
                mounts.remove(name);
                info!(path = %target.display(), "volume unmounted");
                Ok(())
            }
            count => {
                mounts.insert(name.to_owned(), count - 1);
                debug!(count = count - 1, "volume still in use");
                Ok(())
            }
        }
    }
}

/// Create `target` if needed; an existing non-directory is an error.
async fn ensure_mount_dir(target: &Path) -> Result<()> {
    let failed = |reason: String| VolError::MountFailed {
        path: target.display().to_string(),
        reason,
    };
    match tokio::fs::metadata(target).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(failed("exists and is not a directory".to_owned())),
        Err(e) if e.kind() == ErrorKind::NotFound => tokio::fs::create_dir_all(target)
            .await
            .map_err(|e| failed(format!("create mount directory: {e}"))),
        Err(e) => Err(failed(e.to_string())),
    }
}
