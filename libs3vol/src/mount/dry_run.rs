//! Mount helper that records invocations instead of running anything.
//!
//! Used by `s3vol serve --dry-run` to exercise the plugin without FUSE, and
//! by the coordinator and lifecycle tests.  Only the most recent
//! [`MAX_RECORDED_CALLS`] invocations are kept, so a long-running dry-run
//! server stays bounded; the totals keep counting.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::info;

use super::MountHelper;
use crate::error::{Result, VolError};

/// Size of the invocation history.
pub const MAX_RECORDED_CALLS: usize = 1024;

/// One recorded helper invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperCall {
    Mount {
        bucket: String,
        target: PathBuf,
        options: String,
    },
    Unmount {
        target: PathBuf,
    },
}

#[derive(Debug, Default)]
struct State {
    calls: VecDeque<HelperCall>,
    mounts: usize,
    unmounts: usize,
    failing_mounts: u32,
    failing_unmounts: u32,
}

impl State {
    fn record(&mut self, call: HelperCall) {
        if self.calls.len() == MAX_RECORDED_CALLS {
            self.calls.pop_front();
        }
        self.calls.push_back(call);
    }
}

/// [`MountHelper`] that only logs and records.
#[derive(Debug, Default)]
pub struct DryRunHelper {
    state: Mutex<State>,
}

impl DryRunHelper {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Recent invocations, oldest first.
    pub fn calls(&self) -> Vec<HelperCall> {
        self.state().calls.iter().cloned().collect()
    }

    /// Mount calls so far, failed ones included.
    pub fn mounts(&self) -> usize {
        self.state().mounts
    }

    /// Unmount calls so far, failed ones included.
    pub fn unmounts(&self) -> usize {
        self.state().unmounts
    }

    /// Make the next `n` mount calls fail after being recorded.
    pub fn fail_next_mounts(&self, n: u32) {
        self.state().failing_mounts = n;
    }

    /// Make the next `n` unmount calls fail after being recorded.
    pub fn fail_next_unmounts(&self, n: u32) {
        self.state().failing_unmounts = n;
    }
}

#[async_trait]
impl MountHelper for DryRunHelper {
    async fn mount(&self, bucket: &str, target: &Path, options: &str) -> Result<()> {
        let mut state = self.state();
        state.mounts += 1;
        state.record(HelperCall::Mount {
            bucket: bucket.to_owned(),
            target: target.to_path_buf(),
            options: options.to_owned(),
        });
        if state.failing_mounts > 0 {
            state.failing_mounts -= 1;
            return Err(VolError::MountFailed {
                path: target.display().to_string(),
                reason: "injected failure".to_owned(),
            });
        }
        info!(%bucket, target = %target.display(), %options, "dry-run mount");
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        let mut state = self.state();
        state.unmounts += 1;
        state.record(HelperCall::Unmount {
            target: target.to_path_buf(),
        });
        if state.failing_unmounts > 0 {
            state.failing_unmounts -= 1;
            return Err(VolError::UnmountFailed {
                path: target.display().to_string(),
                reason: "injected failure".to_owned(),
            });
        }
        info!(target = %target.display(), "dry-run unmount");
        Ok(())
    }
}
