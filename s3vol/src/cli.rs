//! Command-line definition.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Default location Docker scans for plugin sockets.
pub const DEFAULT_SOCKET: &str = "/run/docker/plugins/s3vol.sock";

#[derive(Parser, Debug)]
#[command(name = "s3vol", version, about = "Object-store backed Docker volume plugin")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Settings shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Object store: `s3://` (the server given by `--endpoint`), `memory://`,
    /// `dir:///path` or a plain directory path.
    #[arg(long, env = "S3VOL_STORE", default_value = "s3://", global = true)]
    pub store: String,

    /// S3 server URL; an `https://` scheme turns on TLS.
    #[arg(long, env = "S3VOL_ENDPOINT", default_value = libs3vol::store::s3::DEFAULT_ENDPOINT, global = true)]
    pub endpoint: String,

    /// S3 access key.
    #[arg(long, env = "S3VOL_ACCESSKEY", default_value = "", hide_default_value = true, global = true)]
    pub access_key: String,

    /// S3 secret key.
    #[arg(long, env = "S3VOL_SECRETKEY", default_value = "", hide_default_value = true, hide_env_values = true, global = true)]
    pub secret_key: String,

    /// Bucket holding the shared `volumes` registry object.
    #[arg(long, env = "S3VOL_CONFIGBUCKET", default_value = libs3vol::config::DEFAULT_CONFIG_BUCKET, global = true)]
    pub config_bucket: String,

    /// Region used when creating buckets.
    #[arg(long, env = "S3VOL_REGION", default_value = libs3vol::config::DEFAULT_REGION, global = true)]
    pub region: String,

    /// Directory under which volumes are mounted.
    #[arg(long, env = "S3FS_ROOT", default_value = libs3vol::config::DEFAULT_ROOT_MOUNT, global = true)]
    pub root: PathBuf,

    /// Mount options applied to every volume, e.g. `allow_other,uid=1000`.
    #[arg(long, env = "S3VOL_DEFAULTS", default_value = "", global = true)]
    pub defaults: String,

    /// Turn `_` into `-` when deriving bucket names from volume names.
    #[arg(long, env = "S3VOL_REPLACEUNDERSCORES", global = true)]
    pub replace_underscores: bool,

    /// Identity written into registry locks (defaults to the hostname).
    #[arg(long, env = "S3VOL_IDENTITY", global = true)]
    pub identity: Option<String>,

    /// Delay between two polls of a held registry lock, in milliseconds.
    #[arg(long, env = "S3VOL_LOCK_INTERVAL_MS", default_value_t = 50, global = true)]
    pub lock_interval_ms: u64,

    /// Polls of a held registry lock before giving up.
    #[arg(long, env = "S3VOL_LOCK_ATTEMPTS", default_value_t = 100, global = true)]
    pub lock_attempts: u32,

    /// Program mounting a bucket: `<program> <bucket> <target> -o <options>`.
    #[arg(long, env = "S3VOL_MOUNT_PROGRAM", default_value = "s3fs", global = true)]
    pub mount_program: String,

    /// Program unmounting a volume: `<program> -u <target>`.
    #[arg(long, env = "S3VOL_UNMOUNT_PROGRAM", default_value = "fusermount", global = true)]
    pub unmount_program: String,

    /// Seconds a mount helper may run; 0 waits forever.
    #[arg(long, env = "S3VOL_HELPER_TIMEOUT", default_value_t = 120, global = true)]
    pub helper_timeout: u64,

    /// Log at debug level, ignoring RUST_LOG.
    #[arg(long, env = "S3VOL_DEBUG", global = true)]
    pub debug: bool,

    /// Emit logs as JSON lines.
    #[arg(long, env = "S3VOL_LOG_JSON", global = true)]
    pub log_json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the volume plugin on a Unix socket.
    Serve(ServeArgs),

    /// Inspect or edit the volume registry directly.
    #[command(subcommand)]
    Volume(VolumeCommand),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Socket the plugin listens on.
    #[arg(long, env = "S3VOL_SOCKET", default_value = DEFAULT_SOCKET)]
    pub socket: PathBuf,

    /// Record mount requests instead of running the mount helper.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Subcommand, Debug)]
pub enum VolumeCommand {
    /// List registered volumes.
    List,
    /// Show one volume.
    Get { name: String },
    /// Register a volume and create its bucket.
    Create {
        name: String,
        /// Volume mount options, e.g. `ro,uid=1000`.
        #[arg(short, long, default_value = "")]
        options: String,
    },
    /// Delete a volume's bucket and registry entry.
    Remove { name: String },
}
