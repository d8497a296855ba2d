//! Mount helper backed by external programs.
//!
//! [`CommandHelper`] runs `<mount_program> <bucket> <target> -o <options>`
//! (the s3fs calling convention) and `<unmount_program> <unmount_args...>
//! <target>`.  Any non-zero exit is a failure; the first lines of stderr
//! are kept in the error for the operator.  Each invocation is bounded by
//! [`HelperConfig::timeout`] and the child is killed when the bound expires.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, instrument};

use super::MountHelper;
use crate::error::{Result, VolError};

/// Maximum number of stderr bytes carried into an error message.
const STDERR_LIMIT: usize = 2048;

/// Programs and limits used by [`CommandHelper`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperConfig {
    /// Mount program, invoked as `<program> <bucket> <target> [-o <options>]`.
    pub mount_program: String,
    /// Unmount program, invoked as `<program> <unmount_args...> <target>`.
    pub unmount_program: String,
    pub unmount_args: Vec<String>,
    /// Upper bound for one helper run; `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            mount_program: "s3fs".to_owned(),
            unmount_program: "fusermount".to_owned(),
            unmount_args: vec!["-u".to_owned()],
            timeout: Some(Duration::from_secs(120)),
        }
    }
}

/// [`MountHelper`] that spawns the configured programs.
#[derive(Debug, Clone, Default)]
pub struct CommandHelper {
    config: HelperConfig,
}

impl CommandHelper {
    pub fn new(config: HelperConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HelperConfig {
        &self.config
    }

    /// Run `cmd` to completion; `Err` carries a human-readable reason.
    async fn run(&self, mut cmd: Command) -> std::result::Result<(), String> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!(?cmd, "running mount helper");

        let child = cmd.spawn().map_err(|e| format!("spawn: {e}"))?;
        let output = match self.config.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| format!("timed out after {limit:?}"))?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| format!("wait: {e}"))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut stderr = stderr.trim().to_owned();
        if stderr.len() > STDERR_LIMIT {
            let mut cut = STDERR_LIMIT;
            while !stderr.is_char_boundary(cut) {
                cut -= 1;
            }
            stderr.truncate(cut);
        }
        Err(match output.status.code() {
            Some(code) if stderr.is_empty() => format!("exit code {code}"),
            Some(code) => format!("exit code {code}: {stderr}"),
            None => format!("terminated by signal: {stderr}"),
        })
    }
}

#[async_trait]
impl MountHelper for CommandHelper {
    #[instrument(skip(self), fields(program = %self.config.mount_program))]
    async fn mount(&self, bucket: &str, target: &Path, options: &str) -> Result<()> {
        let mut cmd = Command::new(&self.config.mount_program);
        cmd.arg(bucket).arg(target);
        if !options.is_empty() {
            cmd.arg("-o").arg(options);
        }
        self.run(cmd).await.map_err(|reason| {
            error!(target = %target.display(), %reason, "mount helper failed");
            VolError::MountFailed {
                path: target.display().to_string(),
                reason,
            }
        })
    }

    #[instrument(skip(self), fields(program = %self.config.unmount_program))]
    async fn unmount(&self, target: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.config.unmount_program);
        cmd.args(&self.config.unmount_args).arg(target);
        self.run(cmd).await.map_err(|reason| {
            error!(target = %target.display(), %reason, "unmount helper failed");
            VolError::UnmountFailed {
                path: target.display().to_string(),
                reason,
            }
        })
    }
}
