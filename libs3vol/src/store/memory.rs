//! In-process object store.
//!
//! [`MemoryStore`] keeps buckets in a [`DashMap`] and supports injecting
//! transport failures and latency per operation, which the registry, lock
//! and lifecycle tests use to exercise partial-failure paths and races.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{ObjectStat, ObjectStore, fold_keys};
use crate::error::{Result, VolError};
use crate::types::BucketInfo;

/// Gateway operation, used to target injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    BucketExists,
    MakeBucket,
    RemoveBucket,
    StatObject,
    GetObject,
    PutObject,
    RemoveObject,
    ListObjects,
    RemoveObjects,
    ListBuckets,
}

#[derive(Debug)]
struct MemBucket {
    created: DateTime<Utc>,
    objects: BTreeMap<String, Bytes>,
}

/// Object store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    buckets: DashMap<String, MemBucket>,
    /// Injected failures per operation: calls to let through, then calls
    /// to fail.
    faults: DashMap<StoreOp, (u32, u32)>,
    /// Calls per operation, including failed ones.
    calls: DashMap<StoreOp, u64>,
    /// Latency added before each call of an operation.
    delays: DashMap<StoreOp, Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls of `op` fail with a transport error.
    pub fn fail_next(&self, op: StoreOp, times: u32) {
        self.fail_after(op, 0, times);
    }

    /// Let `skip` calls of `op` through, then fail the following `times`.
    pub fn fail_after(&self, op: StoreOp, skip: u32, times: u32) {
        self.faults.insert(op, (skip, times));
    }

    /// Delay every later call of `op` by `latency`.
    pub fn delay(&self, op: StoreOp, latency: Duration) {
        self.delays.insert(op, latency);
    }

    /// Number of times `op` has been invoked.
    pub fn calls(&self, op: StoreOp) -> u64 {
        self.calls.get(&op).map(|c| *c).unwrap_or(0)
    }

    /// Create a bucket with an explicit creation time.
    pub fn insert_bucket(&self, bucket: &str, created: DateTime<Utc>) {
        self.buckets.insert(
            bucket.to_owned(),
            MemBucket {
                created,
                objects: BTreeMap::new(),
            },
        );
    }

    async fn enter(&self, op: StoreOp) -> Result<()> {
        *self.calls.entry(op).or_insert(0) += 1;
        let latency = self.delays.get(&op).map(|d| *d);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let Some(mut fault) = self.faults.get_mut(&op) else {
            return Ok(());
        };
        let (skip, times) = &mut *fault;
        if *skip > 0 {
            *skip -= 1;
            return Ok(());
        }
        if *times > 0 {
            *times -= 1;
            return Err(VolError::Transport(format!("injected {op:?} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        self.enter(StoreOp::BucketExists).await?;
        Ok(self.buckets.contains_key(bucket))
    }

    async fn make_bucket(&self, bucket: &str, _region: &str) -> Result<()> {
        self.enter(StoreOp::MakeBucket).await?;
        self.buckets
            .entry(bucket.to_owned())
            .or_insert_with(|| MemBucket {
                created: Utc::now(),
                objects: BTreeMap::new(),
            });
        Ok(())
    }

    async fn remove_bucket(&self, bucket: &str) -> Result<()> {
        self.enter(StoreOp::RemoveBucket).await?;
        let Some(entry) = self.buckets.get(bucket) else {
            return Err(VolError::BucketNotFound(bucket.to_owned()));
        };
        if !entry.objects.is_empty() {
            return Err(VolError::Transport(format!("bucket {bucket} is not empty")));
        }
        drop(entry);
        self.buckets.remove(bucket);
        Ok(())
    }

    async fn stat_object(&self, bucket: &str, key: &str) -> Result<ObjectStat> {
        self.enter(StoreOp::StatObject).await?;
        let b = self
            .buckets
            .get(bucket)
            .ok_or_else(|| VolError::BucketNotFound(bucket.to_owned()))?;
        b.objects
            .get(key)
            .map(|body| ObjectStat {
                size: body.len() as u64,
            })
            .ok_or_else(|| VolError::ObjectNotFound {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
            })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes> {
        self.enter(StoreOp::GetObject).await?;
        let b = self
            .buckets
            .get(bucket)
            .ok_or_else(|| VolError::BucketNotFound(bucket.to_owned()))?;
        b.objects
            .get(key)
            .cloned()
            .ok_or_else(|| VolError::ObjectNotFound {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
            })
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        self.enter(StoreOp::PutObject).await?;
        let mut b = self
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| VolError::BucketNotFound(bucket.to_owned()))?;
        b.objects.insert(key.to_owned(), body);
        Ok(())
    }

    async fn remove_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.enter(StoreOp::RemoveObject).await?;
        let mut b = self
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| VolError::BucketNotFound(bucket.to_owned()))?;
        b.objects.remove(key);
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        recursive: bool,
    ) -> Result<Vec<String>> {
        self.enter(StoreOp::ListObjects).await?;
        let b = self
            .buckets
            .get(bucket)
            .ok_or_else(|| VolError::BucketNotFound(bucket.to_owned()))?;
        Ok(fold_keys(
            b.objects.keys().map(String::as_str),
            prefix,
            recursive,
        ))
    }

    async fn remove_objects(&self, bucket: &str, keys: &[String]) -> Result<()> {
        self.enter(StoreOp::RemoveObjects).await?;
        let mut b = self
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| VolError::BucketNotFound(bucket.to_owned()))?;
        for key in keys {
            b.objects.remove(key);
        }
        Ok(())
    }

    async fn list_buckets(&self) -> Result<Vec<BucketInfo>> {
        self.enter(StoreOp::ListBuckets).await?;
        let mut out: Vec<BucketInfo> = self
            .buckets
            .iter()
            .map(|entry| BucketInfo {
                name: entry.key().clone(),
                created: entry.value().created,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}
