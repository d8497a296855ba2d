//! Directory-backed object store.
//!
//! [`DirStore`] maps every bucket to a sub-directory of `root` and every
//! object to a file below it, so several hosts sharing `root` (NFS, a
//! cluster filesystem) see the same registry and lock sentinels.
//!
//! # On-disk layout
//!
//! ```text
//! <root>/
//!   <bucket>/                # one directory per bucket
//!     <key>                  # object body; `/` in keys become sub-directories
//!     .s3vol-tmp-<uuid>      # in-flight write, renamed over <key> when complete
//! ```

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{ObjectStat, ObjectStore, fold_keys};
use crate::error::{Result, VolError};
use crate::types::BucketInfo;

/// Prefix of files holding writes that have not been renamed into place.
const TMP_PREFIX: &str = ".s3vol-tmp-";

/// Object store rooted at a local (or shared) directory.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    /// Open a store at `root`, creating the directory if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| VolError::Transport(format!("create store root {}: {e}", root.display())))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_path(&self, bucket: &str) -> Result<PathBuf> {
        if bucket.is_empty() || !is_plain_relative(Path::new(bucket)) || bucket.contains('/') {
            return Err(VolError::InvalidArgument(format!("invalid bucket name {bucket:?}")));
        }
        Ok(self.root.join(bucket))
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        let bucket_path = self.bucket_path(bucket)?;
        let file_name = Path::new(key).file_name().and_then(|n| n.to_str());
        let bad = key.is_empty()
            || key.ends_with('/')
            || !is_plain_relative(Path::new(key))
            || file_name.is_some_and(|n| n.starts_with(TMP_PREFIX));
        if bad {
            return Err(VolError::InvalidArgument(format!("invalid object key {key:?}")));
        }
        Ok(bucket_path.join(key))
    }

    async fn require_bucket(&self, bucket: &str) -> Result<PathBuf> {
        let path = self.bucket_path(bucket)?;
        match tokio::fs::metadata(&path).await {
            Ok(m) if m.is_dir() => Ok(path),
            Ok(_) => Err(VolError::BucketNotFound(bucket.to_owned())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(VolError::BucketNotFound(bucket.to_owned()))
            }
            Err(e) => Err(VolError::Transport(format!("stat bucket {bucket}: {e}"))),
        }
    }

    fn object_error(bucket: &str, key: &str, op: &str, e: std::io::Error) -> VolError {
        if e.kind() == ErrorKind::NotFound {
            VolError::ObjectNotFound {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
            }
        } else {
            VolError::Transport(format!("{op} {bucket}/{key}: {e}"))
        }
    }

    /// Remove now-empty directories between `path` and its bucket root.
    async fn prune_empty_parents(bucket_root: &Path, path: &Path) {
        let mut dir = path.parent();
        while let Some(d) = dir {
            if d == bucket_root || !d.starts_with(bucket_root) {
                break;
            }
            if tokio::fs::remove_dir(d).await.is_err() {
                break;
            }
            dir = d.parent();
        }
    }

    /// Every object key under `bucket_root`, sorted.
    async fn walk(bucket_root: &Path) -> std::io::Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![bucket_root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if name.starts_with(TMP_PREFIX) {
                    continue;
                }
                let Ok(rel) = path.strip_prefix(bucket_root) else {
                    continue;
                };
                let key = rel
                    .components()
                    .filter_map(|c| c.as_os_str().to_str())
                    .collect::<Vec<_>>()
                    .join("/");
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Only normal components: no root, `.`, `..` or prefixes.
fn is_plain_relative(path: &Path) -> bool {
    path.components().all(|c| matches!(c, Component::Normal(_)))
}

#[async_trait]
impl ObjectStore for DirStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        match self.require_bucket(bucket).await {
            Ok(_) => Ok(true),
            Err(VolError::BucketNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn make_bucket(&self, bucket: &str, region: &str) -> Result<()> {
        let path = self.bucket_path(bucket)?;
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| VolError::Transport(format!("create bucket {bucket}: {e}")))?;
        debug!(%bucket, %region, path = %path.display(), "bucket directory ready");
        Ok(())
    }

    async fn remove_bucket(&self, bucket: &str) -> Result<()> {
        let path = self.require_bucket(bucket).await?;
        tokio::fs::remove_dir(&path)
            .await
            .map_err(|e| VolError::Transport(format!("remove bucket {bucket}: {e}")))
    }

    async fn stat_object(&self, bucket: &str, key: &str) -> Result<ObjectStat> {
        self.require_bucket(bucket).await?;
        let path = self.object_path(bucket, key)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| Self::object_error(bucket, key, "stat", e))?;
        if !meta.is_file() {
            return Err(VolError::ObjectNotFound {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
            });
        }
        Ok(ObjectStat { size: meta.len() })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes> {
        self.require_bucket(bucket).await?;
        let path = self.object_path(bucket, key)?;
        let body = tokio::fs::read(&path)
            .await
            .map_err(|e| Self::object_error(bucket, key, "read", e))?;
        Ok(Bytes::from(body))
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        self.require_bucket(bucket).await?;
        let path = self.object_path(bucket, key)?;
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| VolError::Transport(format!("create {}: {e}", parent.display())))?;

        // Rename is atomic within a directory: readers see the old or the
        // new body, never a partial one.
        let tmp = parent.join(format!("{TMP_PREFIX}{}", uuid::Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&tmp, &body).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(VolError::Transport(format!("write {bucket}/{key}: {e}")));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(VolError::Transport(format!("commit {bucket}/{key}: {e}")));
        }
        Ok(())
    }

    async fn remove_object(&self, bucket: &str, key: &str) -> Result<()> {
        let bucket_root = self.require_bucket(bucket).await?;
        let path = self.object_path(bucket, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                Self::prune_empty_parents(&bucket_root, &path).await;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VolError::Transport(format!("remove {bucket}/{key}: {e}"))),
        }
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        recursive: bool,
    ) -> Result<Vec<String>> {
        let bucket_root = self.require_bucket(bucket).await?;
        let keys = Self::walk(&bucket_root)
            .await
            .map_err(|e| VolError::Transport(format!("list {bucket}: {e}")))?;
        Ok(fold_keys(keys.iter().map(String::as_str), prefix, recursive))
    }

    async fn remove_objects(&self, bucket: &str, keys: &[String]) -> Result<()> {
        for key in keys {
            self.remove_object(bucket, key).await?;
        }
        Ok(())
    }

    async fn list_buckets(&self) -> Result<Vec<BucketInfo>> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| VolError::Transport(format!("read store root: {e}")))?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(VolError::transport)? {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                warn!(path = %entry.path().display(), "skipping non UTF-8 bucket directory");
                continue;
            };
            let created = meta
                .created()
                .or_else(|_| meta.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            out.push(BucketInfo { name, created });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, DirStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = DirStore::open(tmp.path().join("objects")).await.unwrap();
        (tmp, store)
    }

    #[tokio::test]
    async fn object_roundtrip_on_disk() {
        let (_tmp, store) = store().await;
        store.make_bucket("cfg", "us-east-1").await.unwrap();
        store
            .put_object("cfg", "volumes", Bytes::from("# header\n"))
            .await
            .unwrap();
        assert!(store.root().join("cfg/volumes").is_file());
        assert_eq!(store.get_object("cfg", "volumes").await.unwrap(), "# header\n");
        assert_eq!(store.stat_object("cfg", "volumes").await.unwrap().size, 9);
    }

    #[tokio::test]
    async fn not_found_kinds() {
        let (_tmp, store) = store().await;
        assert!(!store.bucket_exists("cfg").await.unwrap());
        assert_eq!(
            store.get_object("cfg", "volumes").await.unwrap_err(),
            VolError::BucketNotFound("cfg".into())
        );
        store.make_bucket("cfg", "r").await.unwrap();
        assert!(matches!(
            store.stat_object("cfg", "volumes").await,
            Err(VolError::ObjectNotFound { .. })
        ));
        // Removing a missing object is not an error.
        store.remove_object("cfg", "volumes").await.unwrap();
    }

    #[tokio::test]
    async fn rejects_escaping_keys() {
        let (_tmp, store) = store().await;
        store.make_bucket("b", "r").await.unwrap();
        for key in ["../x", "/etc/passwd", "a/../../x", ""] {
            assert!(
                matches!(
                    store.put_object("b", key, Bytes::new()).await,
                    Err(VolError::InvalidArgument(_))
                ),
                "{key:?}"
            );
        }
        assert!(store.make_bucket("..", "r").await.is_err());
    }

    #[tokio::test]
    async fn nested_keys_list_and_purge() {
        let (_tmp, store) = store().await;
        store.make_bucket("data", "r").await.unwrap();
        for key in ["a/1", "a/b/2", "top"] {
            store.put_object("data", key, Bytes::from("x")).await.unwrap();
        }
        assert_eq!(
            store.list_objects("data", "", true).await.unwrap(),
            vec!["a/1", "a/b/2", "top"]
        );
        assert_eq!(
            store.list_objects("data", "", false).await.unwrap(),
            vec!["a/", "top"]
        );

        super::super::purge_bucket(&store, "data").await.unwrap();
        assert!(!store.bucket_exists("data").await.unwrap());
    }

    #[tokio::test]
    async fn list_buckets_reports_directories() {
        let (_tmp, store) = store().await;
        store.make_bucket("b2", "r").await.unwrap();
        store.make_bucket("b1", "r").await.unwrap();
        let names: Vec<_> = store
            .list_buckets()
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names, vec!["b1", "b2"]);
    }
}
