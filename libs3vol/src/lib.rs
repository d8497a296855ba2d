//! # libs3vol — object-store backed volumes for container hosts
//!
//! `libs3vol` turns buckets of an S3-style object store into named volumes
//! that a container engine can create, mount and remove through the Docker
//! volume plugin protocol.  The set of volumes lives in a single shared
//! registry object so every host using the same config bucket sees the same
//! volumes; mounts are reference counted per host and performed by an
//! external FUSE helper (`s3fs` by default).
//!
//! It follows the RK8s conventions: Tokio async runtime, `tracing` for
//! observability, `thiserror` for structured errors.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `VolumeDefinition`, `VolumeInfo`, capabilities. |
//! | [`error`] | [`VolError`] enum covering all failure modes. |
//! | [`options`] | Mount option codec (`key,key=value`). |
//! | [`store`] | [`ObjectStore`] gateway trait with S3, memory and directory backends. |
//! | [`lock`] | Sentinel-object lock ([`ObjectLock`]) and [`with_lock`]. |
//! | [`registry`] | [`Registry`] of volume definitions in the `volumes` object. |
//! | [`mount`] | [`MountCoordinator`] refcounts and mount helpers. |
//! | [`lifecycle`] | [`VolumeLifecycle`] trait: create, list, get, remove, mount, unmount. |
//! | [`driver`] | [`S3Driver`], the lifecycle implementation. |
//! | [`config`] | [`DriverConfig`] settings. |
//! | [`message`] | Docker plugin request/response bodies. |
//! | [`transport`] | Unix-socket HTTP server built on `hyper`. |

pub mod config;
pub mod driver;
pub mod error;
pub mod lifecycle;
pub mod lock;
pub mod message;
pub mod mount;
pub mod options;
pub mod registry;
pub mod store;
pub mod transport;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use config::DriverConfig;
pub use driver::S3Driver;
pub use error::VolError;
pub use lifecycle::VolumeLifecycle;
pub use lock::{LockConfig, ObjectLock, ResourceLock, with_lock};
pub use message::{PluginRequest, PluginResponse};
pub use mount::{CommandHelper, DryRunHelper, HelperConfig, MountCoordinator, MountHelper};
pub use registry::Registry;
pub use store::{DirStore, MemoryStore, ObjectStore, S3Config, S3Store};
pub use transport::PluginServer;
pub use types::*;
