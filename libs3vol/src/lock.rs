//! Cooperative lock over object-store primitives.
//!
//! The store has no compare-and-swap, so [`ObjectLock`] encodes ownership in
//! a sentinel object `<resource>.ext.lock` whose body is the holder's
//! identity (the hostname by default):
//!
//! * `lock` polls until the sentinel is absent, then writes it.  Two callers
//!   can both observe absence and both write; the lock is advisory and gives
//!   no fencing token.  A store error while polling aborts immediately, only
//!   "sentinel present" is retried.
//! * `unlock` deletes the sentinel only when its body is our identity.  An
//!   absent sentinel counts as already unlocked.
//!
//! Callers use [`with_lock`] so the sentinel is released on every exit path
//! of the protected operation.  A store with a real conditional write can
//! provide another [`ResourceLock`] without touching callers.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Result, VolError};
use crate::store::ObjectStore;

/// Suffix appended to the protected object's name to form the sentinel key.
pub const LOCK_EXT: &str = ".ext.lock";

/// Delay between two polls of a held sentinel.
pub const DEFAULT_LOCK_INTERVAL: Duration = Duration::from_millis(50);

/// Polls before giving up (about five seconds at the default interval).
pub const DEFAULT_LOCK_ATTEMPTS: u32 = 100;

/// Polling and identity settings for [`ObjectLock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    pub interval: Duration,
    pub max_attempts: u32,
    /// Written into the sentinel; compared on unlock.
    pub identity: String,
}

impl LockConfig {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            interval: DEFAULT_LOCK_INTERVAL,
            max_attempts: DEFAULT_LOCK_ATTEMPTS,
            identity: identity.into(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self::new(host_identity().unwrap_or_else(|_| "localhost".to_owned()))
    }
}

/// This host's name, used as the default lock identity.
pub fn host_identity() -> Result<String> {
    let name = nix::unistd::gethostname()
        .map_err(|e| VolError::Internal(format!("could not get hostname: {e}")))?;
    name.into_string()
        .map_err(|_| VolError::Internal("hostname is not valid UTF-8".to_owned()))
}

/// Sentinel object key protecting `resource`.
pub fn sentinel_key(resource: &str) -> String {
    format!("{resource}{LOCK_EXT}")
}

/// Mutual exclusion over a named object in a bucket.
#[async_trait]
pub trait ResourceLock: Send + Sync {
    /// Block until `resource` in `bucket` is held by us.
    async fn lock(&self, bucket: &str, resource: &str) -> Result<()>;

    /// Release `resource`.  Releasing an unheld lock succeeds.
    async fn unlock(&self, bucket: &str, resource: &str) -> Result<()>;
}

/// Run `f` while holding `resource`, releasing it whatever `f` returns.
///
/// When `f` fails and the release fails too, the error of `f` is returned
/// and the release failure is logged.
pub async fn with_lock<T, F, Fut>(
    lock: &dyn ResourceLock,
    bucket: &str,
    resource: &str,
    f: F,
) -> Result<T>
where
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = Result<T>> + Send,
{
    lock.lock(bucket, resource).await?;
    let result = f().await;
    match (result, lock.unlock(bucket, resource).await) {
        (result, Ok(())) => result,
        (Ok(_), Err(release)) => Err(release),
        (Err(op), Err(release)) => {
            error!(%bucket, %resource, error = %release, "could not release lock after failed operation");
            Err(op)
        }
    }
}

/// [`ResourceLock`] backed by sentinel objects in an [`ObjectStore`].
pub struct ObjectLock {
    store: Arc<dyn ObjectStore>,
    config: LockConfig,
}

impl ObjectLock {
    pub fn new(store: Arc<dyn ObjectStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    /// Identity stored in the sentinel, `None` when there is no sentinel.
    async fn holder(&self, bucket: &str, key: &str) -> Result<Option<String>> {
        match self.store.get_object(bucket, key).await {
            Ok(body) => Ok(Some(String::from_utf8_lossy(&body).into_owned())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ResourceLock for ObjectLock {
    #[instrument(skip(self), fields(identity = %self.config.identity))]
    async fn lock(&self, bucket: &str, resource: &str) -> Result<()> {
        let key = sentinel_key(resource);
        let mut attempts = 0u32;
        while let Some(holder) = self.holder(bucket, &key).await? {
            attempts += 1;
            if attempts >= self.config.max_attempts {
                error!(%bucket, lock = %key, %holder, attempts, "lock did not disappear");
                return Err(VolError::LockTimeout {
                    resource: resource.to_owned(),
                    holder,
                    attempts,
                });
            }
            debug!(%bucket, lock = %key, %holder, attempts, "lock is held, waiting");
            tokio::time::sleep(self.config.interval).await;
        }

        self.store
            .put_object(bucket, &key, Bytes::from(self.config.identity.clone()))
            .await?;
        info!(%bucket, %resource, "locked");
        Ok(())
    }

    #[instrument(skip(self), fields(identity = %self.config.identity))]
    async fn unlock(&self, bucket: &str, resource: &str) -> Result<()> {
        let key = sentinel_key(resource);
        let Some(holder) = self.holder(bucket, &key).await? else {
            warn!(%bucket, lock = %key, "lock already absent on unlock");
            return Ok(());
        };
        if holder != self.config.identity {
            error!(%bucket, lock = %key, %holder, "lock not held by this host");
            return Err(VolError::LockNotHeld {
                resource: resource.to_owned(),
                holder,
            });
        }
        self.store.remove_object(bucket, &key).await?;
        info!(%bucket, %resource, "unlocked");
        Ok(())
    }
}
