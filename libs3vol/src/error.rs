//! s3vol error types.
//!
//! All errors in the `libs3vol` crate are represented by the [`VolError`]
//! enum, which derives [`thiserror::Error`].  The variants follow the
//! failure taxonomy of the plugin: transport failures surface to the caller,
//! "not found" is kept distinct from transport errors, and lock, conflict and
//! mount-state failures each get their own variant so the plugin adapter can
//! report a single descriptive message.

use thiserror::Error;

/// Unified error type for s3vol operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VolError {
    /// The object store (or its backing medium) could not be reached or
    /// returned an I/O failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The named bucket does not exist.
    #[error("bucket {0} not found")]
    BucketNotFound(String),

    /// The named object does not exist inside its bucket.
    #[error("object {key} not found in bucket {bucket}")]
    ObjectNotFound {
        /// Bucket that was searched.
        bucket: String,
        /// Missing object key.
        key: String,
    },

    /// No registry entry exists for the volume.
    #[error("volume {0} not found")]
    VolumeNotFound(String),

    /// A volume with the same name is already registered with different
    /// options.
    #[error("volume {name} already exists with different options ({existing} != {requested})")]
    Conflict {
        /// Volume name.
        name: String,
        /// Serialized options currently in the registry.
        existing: String,
        /// Serialized options of the rejected request.
        requested: String,
    },

    /// The lock sentinel did not disappear within the polling ceiling.
    #[error("lock on {resource} still held by {holder} after {attempts} attempts")]
    LockTimeout {
        /// Protected object name.
        resource: String,
        /// Identity found in the sentinel at the last poll.
        holder: String,
        /// Number of polls performed.
        attempts: u32,
    },

    /// An unlock was attempted on a sentinel owned by another identity.
    #[error("lock on {resource} is held by {holder}, not by us")]
    LockNotHeld {
        /// Protected object name.
        resource: String,
        /// Identity found in the sentinel.
        holder: String,
    },

    /// An unmount was requested for a volume with no active mount on this
    /// host.
    #[error("volume {0} is not mounted")]
    NotMounted(String),

    /// The volume cannot be removed while it is mounted on this host.
    #[error("volume {name} is in use ({count} active mounts)")]
    VolumeInUse {
        /// Volume name.
        name: String,
        /// Current refcount.
        count: u32,
    },

    /// A mount operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An option string could not be parsed.
    #[error("invalid option {0:?}")]
    InvalidOption(String),

    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl VolError {
    /// Create a [`VolError::Transport`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::Transport(e.to_string())
    }

    /// Create a [`VolError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// `true` for the "missing bucket / object / volume" family, as opposed
    /// to transport or state failures.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::BucketNotFound(_) | Self::ObjectNotFound { .. } | Self::VolumeNotFound(_)
        )
    }

    /// `true` when retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::Transport(_))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = VolError> = std::result::Result<T, E>;
