//! Mapping of command-line settings onto the library configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use libs3vol::store::{DirStore, MemoryStore, ObjectStore, S3Config, S3Store};
use libs3vol::{DriverConfig, HelperConfig, LockConfig, options};

use crate::cli::GlobalArgs;

/// Where the registry and buckets live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// The S3-compatible server named by `--endpoint`.
    S3,
    Memory,
    Dir(PathBuf),
}

impl StoreLocation {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "s3://" => return Ok(Self::S3),
            "memory://" => return Ok(Self::Memory),
            _ => {}
        }
        let path = raw
            .strip_prefix("dir://")
            .or_else(|| raw.strip_prefix("file://"))
            .unwrap_or(raw);
        anyhow::ensure!(
            !path.is_empty() && !path.contains("://"),
            "unsupported store {raw:?}"
        );
        Ok(Self::Dir(PathBuf::from(path)))
    }

    pub async fn open(&self, s3: &S3Config) -> Result<Arc<dyn ObjectStore>> {
        Ok(match self {
            Self::S3 => Arc::new(
                S3Store::new(s3)
                    .with_context(|| format!("failed to configure S3 endpoint {}", s3.endpoint))?,
            ),
            Self::Memory => Arc::new(MemoryStore::new()),
            Self::Dir(root) => Arc::new(
                DirStore::open(root)
                    .await
                    .with_context(|| format!("failed to open store at {}", root.display()))?,
            ),
        })
    }
}

/// Connection settings of the S3 backend.  Buckets are created in the
/// same region the driver uses.
pub fn s3_config(args: &GlobalArgs) -> S3Config {
    S3Config {
        endpoint: args.endpoint.clone(),
        region: args.region.clone(),
        access_key: args.access_key.clone(),
        secret_key: args.secret_key.clone(),
    }
}

/// Build the driver configuration from global flags.
pub fn driver_config(args: &GlobalArgs) -> Result<DriverConfig> {
    let defaults = options::parse(&args.defaults)
        .with_context(|| format!("invalid default options {:?}", args.defaults))?;

    let mut lock = match &args.identity {
        Some(identity) => LockConfig::new(identity.clone()),
        None => LockConfig::default(),
    };
    lock.interval = Duration::from_millis(args.lock_interval_ms);
    anyhow::ensure!(args.lock_attempts > 0, "--lock-attempts must be positive");
    lock.max_attempts = args.lock_attempts;

    let helper = HelperConfig {
        mount_program: args.mount_program.clone(),
        unmount_program: args.unmount_program.clone(),
        timeout: (args.helper_timeout > 0).then(|| Duration::from_secs(args.helper_timeout)),
        ..Default::default()
    };

    Ok(DriverConfig {
        config_bucket: args.config_bucket.clone(),
        region: args.region.clone(),
        root_mount: args.root.clone(),
        replace_underscores: args.replace_underscores,
        defaults,
        lock,
        helper,
    })
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::cli::Cli;

    fn global(args: &[&str]) -> GlobalArgs {
        let mut argv = vec!["s3vol"];
        argv.extend_from_slice(args);
        argv.extend_from_slice(&["volume", "list"]);
        Cli::try_parse_from(argv).unwrap().global
    }

    #[test]
    fn store_locations() {
        assert_eq!(StoreLocation::parse("memory://").unwrap(), StoreLocation::Memory);
        assert_eq!(
            StoreLocation::parse("dir:///srv/s3").unwrap(),
            StoreLocation::Dir(PathBuf::from("/srv/s3"))
        );
        assert_eq!(
            StoreLocation::parse("/srv/s3").unwrap(),
            StoreLocation::Dir(PathBuf::from("/srv/s3"))
        );
        assert_eq!(StoreLocation::parse("s3://").unwrap(), StoreLocation::S3);
        assert!(StoreLocation::parse("s3://bucket").is_err());
        assert!(StoreLocation::parse("dir://").is_err());
    }

    #[test]
    fn flags_map_onto_driver_config() {
        let args = global(&[
            "--config-bucket",
            "cfg",
            "--root",
            "/srv/vols",
            "--defaults",
            "uid=1000,allow_other,nonempty=false",
            "--replace-underscores",
            "--identity",
            "node-7",
            "--lock-attempts",
            "3",
            "--helper-timeout",
            "0",
        ]);
        let config = driver_config(&args).unwrap();
        assert_eq!(config.config_bucket, "cfg");
        assert_eq!(config.root_mount, PathBuf::from("/srv/vols"));
        assert!(config.replace_underscores);
        assert_eq!(options::serialize(&config.defaults), "allow_other,uid=1000");
        assert_eq!(config.lock.identity, "node-7");
        assert_eq!(config.lock.max_attempts, 3);
        assert_eq!(config.helper.timeout, None);
        assert_eq!(config.helper.unmount_args, vec!["-u".to_owned()]);
    }

    #[test]
    fn defaults_match_library() {
        let config = driver_config(&global(&["--identity", "n"])).unwrap();
        let lib = DriverConfig::default();
        assert_eq!(config.config_bucket, lib.config_bucket);
        assert_eq!(config.region, lib.region);
        assert_eq!(config.root_mount, lib.root_mount);
        assert_eq!(config.helper, lib.helper);
        assert_eq!(config.lock.interval, lib.lock.interval);
        assert_eq!(config.lock.max_attempts, lib.lock.max_attempts);
    }

    #[test]
    fn bad_defaults_are_rejected() {
        assert!(driver_config(&global(&["--defaults", "=x"])).is_err());
        assert!(driver_config(&global(&["--lock-attempts", "0"])).is_err());
    }

    #[tokio::test]
    async fn opens_directory_store() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StoreLocation::Dir(tmp.path().join("store"))
            .open(&S3Config::default())
            .await
            .unwrap();
        store.make_bucket("b", "r").await.unwrap();
        assert!(store.bucket_exists("b").await.unwrap());
    }

    #[test]
    fn s3_flags_and_environment() {
        let args = global(&[
            "--endpoint",
            "https://s3.example.com",
            "--access-key",
            "AKIA",
            "--secret-key",
            "hunter2",
            "--region",
            "eu-west-1",
        ]);
        assert_eq!(StoreLocation::parse(&args.store).unwrap(), StoreLocation::S3);
        let s3 = s3_config(&args);
        assert_eq!(s3.endpoint, "https://s3.example.com");
        assert_eq!(s3.region, "eu-west-1");
        assert!(s3.validate().unwrap());
        assert!(!format!("{s3:?}").contains("hunter2"));
    }

    #[tokio::test]
    async fn s3_store_needs_credentials() {
        let args = global(&["--endpoint", "http://127.0.0.1:9"]);
        assert!(StoreLocation::S3.open(&s3_config(&args)).await.is_err());

        let args = global(&[
            "--endpoint",
            "http://127.0.0.1:9",
            "--access-key",
            "a",
            "--secret-key",
            "b",
        ]);
        assert!(StoreLocation::S3.open(&s3_config(&args)).await.is_ok());
    }
}
