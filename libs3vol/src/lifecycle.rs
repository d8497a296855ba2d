//! Volume lifecycle service trait.
//!
//! This is the surface the plugin protocol adapter calls: the operations a
//! container engine issues against a volume driver.  [`S3Driver`] is the
//! object-store backed implementation.
//!
//! [`S3Driver`]: crate::driver::S3Driver

use async_trait::async_trait;

use crate::error::VolError;
use crate::types::{Capabilities, MountOptions, VolumeInfo};

/// Volume lifecycle: registry operations plus host mount/unmount.
#[async_trait]
pub trait VolumeLifecycle: Send + Sync {
    /// Register a volume, creating its backing bucket if needed.
    ///
    /// Creating an existing volume with equivalent options succeeds; with
    /// different options it fails with [`VolError::Conflict`].
    async fn create(&self, name: &str, options: MountOptions) -> Result<(), VolError>;

    /// Every registered volume.
    async fn list(&self) -> Result<Vec<VolumeInfo>, VolError>;

    /// One volume, or [`VolError::VolumeNotFound`].
    async fn get(&self, name: &str) -> Result<VolumeInfo, VolError>;

    /// Delete the backing bucket (best effort) and the registry entry.
    async fn remove(&self, name: &str) -> Result<(), VolError>;

    /// Host path of a registered volume.
    async fn path(&self, name: &str) -> Result<String, VolError>;

    /// Make the volume available on this host for request `request_id`.
    async fn mount(&self, name: &str, request_id: &str) -> Result<String, VolError>;

    /// Release the mount held by request `request_id`.
    async fn unmount(&self, name: &str, request_id: &str) -> Result<(), VolError>;

    /// Static capability answer.
    fn capabilities(&self) -> Capabilities;
}
