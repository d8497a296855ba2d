//! Object-store backed volume driver.
//!
//! [`S3Driver`] composes the [`Registry`] (shared volume definitions) with
//! the [`MountCoordinator`] (host-local refcounts) and answers the
//! [`VolumeLifecycle`] operations:
//!
//! ```text
//!   create  ──► ensure bucket ──► Registry::add
//!   list/get ─► Registry ⨝ list_buckets (creation time) ⨝ refcounts
//!   remove  ──► refuse if mounted here ──► purge bucket (best effort) ──► Registry::remove
//!   mount   ──► Registry::find ──► MountCoordinator::mount
//!   unmount ──► Registry::find ──► MountCoordinator::unmount
//! ```
//!
//! `create`, `remove` and `mount` of one name run under a per-name gate, so
//! a mount cannot slip in between the in-use check of a remove and the
//! deletion of the record.  The configuration bucket never backs a volume.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::DriverConfig;
use crate::error::{Result, VolError};
use crate::lifecycle::VolumeLifecycle;
use crate::lock::{ObjectLock, ResourceLock};
use crate::mount::{MountCoordinator, MountHelper};
use crate::registry::Registry;
use crate::store::{ObjectStore, ensure_bucket, purge_bucket};
use crate::types::{
    Capabilities, MountOptions, Scope, VolumeDefinition, VolumeInfo, format_created_at,
    validate_volume_name,
};

/// Volume driver backed by an [`ObjectStore`] and a [`MountHelper`].
pub struct S3Driver {
    config: DriverConfig,
    store: Arc<dyn ObjectStore>,
    registry: Registry,
    mounts: MountCoordinator,
    /// Per-name gates serializing create, remove and mount on this host.
    gates: DashMap<String, Arc<Mutex<()>>>,
}

impl S3Driver {
    /// Build a driver whose registry is guarded by an [`ObjectLock`] on the
    /// same store, and bootstrap the registry.
    pub async fn new(
        config: DriverConfig,
        store: Arc<dyn ObjectStore>,
        helper: Arc<dyn MountHelper>,
    ) -> Result<Self> {
        let lock = Arc::new(ObjectLock::new(Arc::clone(&store), config.lock.clone()));
        Self::with_lock(config, store, lock, helper).await
    }

    /// Like [`S3Driver::new`] with an explicit lock strategy.
    pub async fn with_lock(
        config: DriverConfig,
        store: Arc<dyn ObjectStore>,
        lock: Arc<dyn ResourceLock>,
        helper: Arc<dyn MountHelper>,
    ) -> Result<Self> {
        let registry = Registry::new(
            Arc::clone(&store),
            lock,
            config.config_bucket.clone(),
            config.region.clone(),
        );
        registry.bootstrap().await?;
        let mounts = MountCoordinator::new(
            config.root_mount.clone(),
            config.defaults.clone(),
            helper,
        );
        info!(%config, "volume driver ready");
        Ok(Self {
            config,
            store,
            registry,
            mounts,
            gates: DashMap::new(),
        })
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn mounts(&self) -> &MountCoordinator {
        &self.mounts
    }

    fn gate(&self, name: &str) -> Arc<Mutex<()>> {
        self.gates.entry(name.to_owned()).or_default().clone()
    }

    /// Bucket name -> display creation time, for every bucket in the store.
    async fn creation_times(&self) -> Result<HashMap<String, String>> {
        let buckets = self.store.list_buckets().await?;
        Ok(buckets
            .into_iter()
            .map(|b| {
                let created = format_created_at(&b.created);
                (b.name, created)
            })
            .collect())
    }

    async fn info(&self, def: &VolumeDefinition, created: &HashMap<String, String>) -> VolumeInfo {
        VolumeInfo {
            name: def.name.clone(),
            mountpoint: self.mounts.mount_path(&def.name).display().to_string(),
            created_at: created.get(&def.bucket).cloned().unwrap_or_default(),
            mounts: self.mounts.mount_count(&def.name).await,
        }
    }
}

#[async_trait]
impl VolumeLifecycle for S3Driver {
    #[instrument(skip(self, options))]
    async fn create(&self, name: &str, options: MountOptions) -> Result<()> {
        validate_volume_name(name)?;
        let def = VolumeDefinition::new(name, self.config.bucket_for(name)).with_options(options);
        def.validate()?;
        if def.bucket == self.config.config_bucket {
            return Err(VolError::InvalidArgument(format!(
                "volume {name} would use the configuration bucket {}",
                def.bucket
            )));
        }

        let gate = self.gate(name);
        let _gate = gate.lock().await;
        ensure_bucket(self.store.as_ref(), &def.bucket, &self.config.region).await?;
        if self.registry.add(&def).await? {
            info!(bucket = %def.bucket, "volume created");
        } else {
            debug!("volume already exists with the same options");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list(&self) -> Result<Vec<VolumeInfo>> {
        let defs = self.registry.list().await?;
        let created = self.creation_times().await?;
        let mut out = Vec::with_capacity(defs.len());
        for def in &defs {
            out.push(self.info(def, &created).await);
        }
        Ok(out)
    }

    #[instrument(skip(self))]
    async fn get(&self, name: &str) -> Result<VolumeInfo> {
        let def = self.registry.find(name).await?;
        let created = self.creation_times().await?;
        Ok(self.info(&def, &created).await)
    }

    #[instrument(skip(self))]
    async fn remove(&self, name: &str) -> Result<()> {
        let gate = self.gate(name);
        let _gate = gate.lock().await;
        let def = match self.registry.find(name).await {
            Ok(def) => def,
            Err(VolError::VolumeNotFound(_)) => {
                warn!("volume not registered, nothing to remove");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let count = self.mounts.mount_count(name).await;
        if count > 0 {
            return Err(VolError::VolumeInUse {
                name: name.to_owned(),
                count,
            });
        }

        // Volumes pointed at the same bucket by hand keep their data.
        let shared = self
            .registry
            .list()
            .await?
            .iter()
            .any(|other| other.name != def.name && other.bucket == def.bucket);
        if def.bucket == self.config.config_bucket {
            warn!(bucket = %def.bucket, "record points at the configuration bucket, keeping it");
        } else if shared {
            warn!(bucket = %def.bucket, "bucket is shared with another volume, keeping it");
        } else if let Err(e) = purge_bucket(self.store.as_ref(), &def.bucket).await {
            warn!(bucket = %def.bucket, error = %e, "could not delete volume bucket");
        }

        self.registry.remove(name).await?;
        info!(bucket = %def.bucket, "volume removed");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn path(&self, name: &str) -> Result<String> {
        let def = self.registry.find(name).await?;
        Ok(self.mounts.mount_path(&def.name).display().to_string())
    }

    #[instrument(skip(self))]
    async fn mount(&self, name: &str, request_id: &str) -> Result<String> {
        let gate = self.gate(name);
        let _gate = gate.lock().await;
        let def = self.registry.find(name).await?;
        let target = self.mounts.mount(&def).await?;
        Ok(target.display().to_string())
    }

    #[instrument(skip(self))]
    async fn unmount(&self, name: &str, request_id: &str) -> Result<()> {
        if let Err(e) = self.registry.find(name).await {
            // Removed elsewhere while mounted here: still release the host mount.
            let mounted = self.mounts.mount_count(name).await > 0;
            if !(mounted && matches!(e, VolError::VolumeNotFound(_))) {
                return Err(e);
            }
            warn!("volume no longer registered, unmounting anyway");
        }
        self.mounts.unmount(name).await
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            scope: Scope::Global,
        }
    }
}
