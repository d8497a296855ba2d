//! Object store gateway.
//!
//! Every component that touches shared state (the registry document, lock
//! sentinels, volume buckets) goes through the [`ObjectStore`] trait.  The
//! contract is the one offered by S3-compatible stores: last-writer-wins
//! `put`, no compare-and-swap, and a "not found" result that is
//! distinguishable from transport failures (see [`VolError::is_not_found`]).
//!
//! Implementations shipped with the crate:
//!
//! | Backend | Purpose |
//! |---|---|
//! | [`S3Store`] | S3-compatible server (MinIO, AWS, ...), the production backend. |
//! | [`MemoryStore`] | In-process store with fault injection, used by tests and dry runs. |
//! | [`DirStore`] | Buckets as directories under a shared root. |

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};

use crate::error::{Result, VolError};
use crate::types::BucketInfo;

pub mod dir;
pub mod memory;
pub mod s3;

pub use dir::DirStore;
pub use memory::MemoryStore;
pub use s3::{S3Config, S3Store};

/// Metadata returned by [`ObjectStore::stat_object`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectStat {
    /// Body length in bytes.
    pub size: u64,
}

/// Bucket/object operations the plugin needs from its object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Whether `bucket` exists.
    async fn bucket_exists(&self, bucket: &str) -> Result<bool>;

    /// Create `bucket` in `region`.  Creating an existing bucket succeeds.
    async fn make_bucket(&self, bucket: &str, region: &str) -> Result<()>;

    /// Delete an empty bucket.
    async fn remove_bucket(&self, bucket: &str) -> Result<()>;

    /// Stat an object; [`VolError::ObjectNotFound`] if it does not exist.
    async fn stat_object(&self, bucket: &str, key: &str) -> Result<ObjectStat>;

    /// Read a whole object.
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes>;

    /// Write a whole object, replacing any previous body.
    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<()>;

    /// Delete an object.  Deleting a missing object succeeds.
    async fn remove_object(&self, bucket: &str, key: &str) -> Result<()>;

    /// List keys starting with `prefix`.  Without `recursive`, keys below the
    /// next `/` are folded into a single `prefix.../` entry.
    async fn list_objects(&self, bucket: &str, prefix: &str, recursive: bool)
    -> Result<Vec<String>>;

    /// Delete many objects from one bucket.
    async fn remove_objects(&self, bucket: &str, keys: &[String]) -> Result<()>;

    /// Every bucket with its creation time.
    async fn list_buckets(&self) -> Result<Vec<BucketInfo>>;
}

/// `Ok(false)` when the object is missing, `Err` only for real failures.
pub async fn object_exists(store: &dyn ObjectStore, bucket: &str, key: &str) -> Result<bool> {
    match store.stat_object(bucket, key).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Create `bucket` unless it already exists.
pub async fn ensure_bucket(store: &dyn ObjectStore, bucket: &str, region: &str) -> Result<()> {
    let exists = store.bucket_exists(bucket).await.map_err(|e| {
        VolError::Transport(format!("could not check existence of bucket {bucket}: {e}"))
    })?;
    if exists {
        debug!(%bucket, "bucket already exists");
        return Ok(());
    }
    store.make_bucket(bucket, region).await?;
    info!(%bucket, %region, "bucket created");
    Ok(())
}

/// Delete every object in `bucket`, then the bucket itself.
pub async fn purge_bucket(store: &dyn ObjectStore, bucket: &str) -> Result<()> {
    let keys = store.list_objects(bucket, "", true).await?;
    if !keys.is_empty() {
        debug!(%bucket, count = keys.len(), "removing bucket objects");
        store.remove_objects(bucket, &keys).await?;
    }
    store.remove_bucket(bucket).await
}

/// Shared listing logic: filter `keys` (sorted, recursive) by `prefix` and
/// fold sub-paths when not `recursive`.
pub(crate) fn fold_keys<'a>(
    keys: impl Iterator<Item = &'a str>,
    prefix: &str,
    recursive: bool,
) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for key in keys {
        let Some(rest) = key.strip_prefix(prefix) else {
            continue;
        };
        let entry = match rest.find('/') {
            Some(idx) if !recursive => format!("{prefix}{}", &rest[..=idx]),
            _ => key.to_owned(),
        };
        if out.last() != Some(&entry) {
            out.push(entry);
        }
    }
    out
}
