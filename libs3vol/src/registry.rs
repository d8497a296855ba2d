//! Volume registry stored as a single text object.
//!
//! The registry is the object `volumes` inside the config bucket.  It is a
//! UTF-8, `\n`-terminated list of lines:
//!
//! ```text
//! # s3vol configuration
//! # volumename;bucket;options
//! photos;photos;allow_other
//! backups;backups-prod;uid=1000,use_cache=/tmp
//! ```
//!
//! Lines starting with `#` (and blank lines) are kept verbatim on every
//! rewrite.  A line that does not split into exactly three `;` fields is
//! warned about and skipped on read, but never corrected on disk: operators
//! fix it by hand.
//!
//! Every mutation rewrites the whole object.  [`Registry::add`] and
//! [`Registry::remove`] serialize the read-modify-write through a local
//! mutex (same process) and the [`ResourceLock`] on `volumes` (other
//! processes and hosts).

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, VolError};
use crate::lock::{ResourceLock, with_lock};
use crate::options;
use crate::store::{ObjectStore, ensure_bucket, object_exists};
use crate::types::VolumeDefinition;

/// Name of the registry object inside the config bucket.
pub const REGISTRY_OBJECT: &str = "volumes";

/// Body written when the registry object is first created.
pub const REGISTRY_HEADER: &str = "# s3vol configuration\n# volumename;bucket;options\n";

/// Classification of one registry line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryLine {
    /// `#` comment or blank line.
    Comment,
    /// Well-formed volume record.
    Record(VolumeDefinition),
    /// Anything else, with the reason it was rejected.
    Malformed(String),
}

impl RegistryLine {
    pub fn parse(line: &str) -> Self {
        if line.trim().is_empty() || line.starts_with('#') {
            return Self::Comment;
        }
        let parts: Vec<&str> = line.splitn(3, ';').collect();
        let &[name, bucket, opts] = parts.as_slice() else {
            return Self::Malformed(format!("expected 3 fields, found {}", parts.len()));
        };
        if name.is_empty() {
            return Self::Malformed("empty volume name".to_owned());
        }
        match options::parse(opts) {
            Ok(options) => Self::Record(VolumeDefinition {
                name: name.to_owned(),
                bucket: bucket.to_owned(),
                options,
            }),
            Err(e) => Self::Malformed(format!("bad options: {e}")),
        }
    }
}

/// Render the record line for `def` (without the trailing newline).
pub fn record_line(def: &VolumeDefinition) -> String {
    format!(
        "{};{};{}",
        def.name,
        def.bucket,
        options::serialize(&def.options)
    )
}

/// Every well-formed record of `text`, in document order.
pub fn parse_document(text: &str) -> Vec<VolumeDefinition> {
    let mut volumes = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        match RegistryLine::parse(line) {
            RegistryLine::Comment => {}
            RegistryLine::Record(def) => volumes.push(def),
            RegistryLine::Malformed(reason) => {
                warn!(line_no = idx + 1, %line, %reason, "skipping malformed registry line");
            }
        }
    }
    volumes
}

/// `text` with the record for `def` appended.
pub fn append_record(text: &str, def: &VolumeDefinition) -> String {
    let mut out = String::with_capacity(text.len() + 64);
    out.push_str(text);
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&record_line(def));
    out.push('\n');
    out
}

/// `text` without the lines whose name field is exactly `name`, and how many
/// were dropped.
pub fn remove_record(text: &str, name: &str) -> (String, usize) {
    let mut out = String::with_capacity(text.len());
    let mut removed = 0;
    for line in text.lines() {
        let is_target = !line.starts_with('#')
            && line
                .split_once(';')
                .is_some_and(|(line_name, _)| line_name == name);
        if is_target {
            removed += 1;
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    (out, removed)
}

/// Shared registry of volume definitions.
pub struct Registry {
    store: Arc<dyn ObjectStore>,
    lock: Arc<dyn ResourceLock>,
    bucket: String,
    region: String,
    /// Serializes mutations issued from this process.
    write_gate: Mutex<()>,
}

impl Registry {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        lock: Arc<dyn ResourceLock>,
        bucket: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            store,
            lock,
            bucket: bucket.into(),
            region: region.into(),
            write_gate: Mutex::new(()),
        }
    }

    /// Config bucket holding the registry object.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Create the config bucket and an empty registry if they are missing.
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    pub async fn bootstrap(&self) -> Result<()> {
        ensure_bucket(self.store.as_ref(), &self.bucket, &self.region).await?;
        if object_exists(self.store.as_ref(), &self.bucket, REGISTRY_OBJECT).await? {
            debug!("registry already present");
            return Ok(());
        }

        let _gate = self.write_gate.lock().await;
        with_lock(self.lock.as_ref(), &self.bucket, REGISTRY_OBJECT, move || async move {
            // Another host may have created it while we waited for the lock.
            if object_exists(self.store.as_ref(), &self.bucket, REGISTRY_OBJECT).await? {
                return Ok(());
            }
            self.write(REGISTRY_HEADER.to_owned()).await?;
            info!("empty registry created");
            Ok(())
        })
        .await
    }

    async fn read(&self) -> Result<String> {
        let body = self.store.get_object(&self.bucket, REGISTRY_OBJECT).await?;
        String::from_utf8(body.to_vec()).map_err(|e| {
            VolError::Internal(format!(
                "registry {}/{REGISTRY_OBJECT} is not UTF-8: {e}",
                self.bucket
            ))
        })
    }

    async fn write(&self, text: String) -> Result<()> {
        self.store
            .put_object(&self.bucket, REGISTRY_OBJECT, Bytes::from(text))
            .await
    }

    /// All well-formed definitions, in document order.
    pub async fn list(&self) -> Result<Vec<VolumeDefinition>> {
        let text = self.read().await?;
        Ok(parse_document(&text))
    }

    /// The first definition named `name`.
    pub async fn find(&self, name: &str) -> Result<VolumeDefinition> {
        let text = self.read().await?;
        for line in text.lines() {
            if let RegistryLine::Record(def) = RegistryLine::parse(line)
                && def.name == name
            {
                return Ok(def);
            }
        }
        Err(VolError::VolumeNotFound(name.to_owned()))
    }

    /// Register `def`.
    ///
    /// Returns `Ok(false)` when an entry with the same name and the same
    /// canonical options already exists, and [`VolError::Conflict`] when the
    /// options differ.
    #[instrument(skip(self, def), fields(volume = %def.name))]
    pub async fn add(&self, def: &VolumeDefinition) -> Result<bool> {
        def.validate()?;
        let requested = options::serialize(&def.options);

        let _gate = self.write_gate.lock().await;
        with_lock(self.lock.as_ref(), &self.bucket, REGISTRY_OBJECT, move || async move {
            let text = self.read().await?;
            if let Some(existing) = parse_document(&text).into_iter().find(|v| v.name == def.name) {
                let current = options::serialize(&existing.options);
                if current == requested {
                    debug!("identical definition already registered");
                    return Ok(false);
                }
                return Err(VolError::Conflict {
                    name: def.name.clone(),
                    existing: current,
                    requested,
                });
            }
            self.write(append_record(&text, def)).await?;
            info!(bucket = %def.bucket, options = %requested, "volume registered");
            Ok(true)
        })
        .await
    }

    /// Drop every record named `name`; comments and other lines are kept.
    ///
    /// Returns whether a record was removed.  Removing an unknown name
    /// leaves the document unchanged.
    #[instrument(skip(self))]
    pub async fn remove(&self, name: &str) -> Result<bool> {
        let _gate = self.write_gate.lock().await;
        with_lock(self.lock.as_ref(), &self.bucket, REGISTRY_OBJECT, move || async move {
            let text = self.read().await?;
            let (rewritten, removed) = remove_record(&text, name);
            if removed == 0 {
                debug!("no registry entry to remove");
                return Ok(false);
            }
            self.write(rewritten).await?;
            info!(removed, "volume unregistered");
            Ok(true)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::lock::{LockConfig, ObjectLock, sentinel_key};
    use crate::store::memory::{MemoryStore, StoreOp};
    use crate::types::MountOptions;

    const CFG: &str = "s3vol";

    fn lock_config(identity: &str) -> LockConfig {
        LockConfig {
            interval: Duration::from_millis(1),
            max_attempts: 5,
            identity: identity.to_owned(),
        }
    }

    async fn setup() -> (Arc<MemoryStore>, Registry) {
        let store = Arc::new(MemoryStore::new());
        let lock = Arc::new(ObjectLock::new(store.clone(), lock_config("node-a")));
        let registry = Registry::new(store.clone(), lock, CFG, "us-east-1");
        registry.bootstrap().await.unwrap();
        (store, registry)
    }

    async fn document(store: &MemoryStore) -> String {
        let body = store.get_object(CFG, REGISTRY_OBJECT).await.unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    fn allow_other() -> MountOptions {
        MountOptions::from([("allow_other".to_owned(), "true".to_owned())])
    }

    #[test]
    fn classify_lines() {
        assert_eq!(RegistryLine::parse("# comment"), RegistryLine::Comment);
        assert_eq!(RegistryLine::parse("   "), RegistryLine::Comment);
        assert!(matches!(
            RegistryLine::parse("only;two"),
            RegistryLine::Malformed(_)
        ));
        assert!(matches!(
            RegistryLine::parse(";b;"),
            RegistryLine::Malformed(_)
        ));
        assert_eq!(
            RegistryLine::parse("v;b;"),
            RegistryLine::Record(VolumeDefinition::new("v", "b"))
        );
        // The third field keeps any further separators.
        let RegistryLine::Record(def) = RegistryLine::parse("v;b;k=a;b") else {
            panic!("expected record");
        };
        assert_eq!(def.options["k"], "a;b");
    }

    #[test]
    fn remove_record_is_exact() {
        let text = "# c\nfoo;b;\nfoo2;b;\nfoobar;x;\n";
        let (out, removed) = remove_record(text, "foo");
        assert_eq!(removed, 1);
        assert_eq!(out, "# c\nfoo2;b;\nfoobar;x;\n");
    }

    #[test]
    fn append_adds_missing_newline() {
        let def = VolumeDefinition::new("v", "b");
        assert_eq!(append_record("# c", &def), "# c\nv;b;\n");
        assert_eq!(append_record("", &def), "v;b;\n");
    }

    #[tokio::test]
    async fn bootstrap_creates_header_once() {
        let (store, registry) = setup().await;
        assert!(store.bucket_exists(CFG).await.unwrap());
        assert_eq!(document(&store).await, REGISTRY_HEADER);

        registry
            .add(&VolumeDefinition::new("a", "b"))
            .await
            .unwrap();
        registry.bootstrap().await.unwrap();
        assert!(document(&store).await.contains("a;b;"));
        assert!(
            store
                .stat_object(CFG, &sentinel_key(REGISTRY_OBJECT))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn empty_registry_then_add_and_find() {
        let (store, registry) = setup().await;
        assert!(registry.list().await.unwrap().is_empty());

        let def = VolumeDefinition::new("photos", "photos").with_options(allow_other());
        assert!(registry.add(&def).await.unwrap());
        assert!(document(&store).await.lines().any(|l| l == "photos;photos;allow_other"));

        let found = registry.find("photos").await.unwrap();
        assert_eq!(found.options, allow_other());
        assert_eq!(found, def);
    }

    #[tokio::test]
    async fn duplicate_add_is_noop_or_conflict() {
        let (_store, registry) = setup().await;
        let def = VolumeDefinition::new("a", "b");
        assert!(registry.add(&def).await.unwrap());
        assert!(!registry.add(&def).await.unwrap());
        assert_eq!(registry.list().await.unwrap().len(), 1);

        let other = VolumeDefinition::new("a", "b").with_options(allow_other());
        let err = registry.add(&other).await.unwrap_err();
        assert!(matches!(err, VolError::Conflict { ref name, .. } if name == "a"));
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn equivalent_options_are_not_a_conflict() {
        let (_store, registry) = setup().await;
        let first = VolumeDefinition::new("a", "b").with_options(allow_other());
        registry.add(&first).await.unwrap();
        let mut options = MountOptions::new();
        options.insert("allow_other".into(), "TRUE".into());
        options.insert("ro".into(), "false".into());
        assert!(
            !registry
                .add(&VolumeDefinition::new("a", "b").with_options(options))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn remove_keeps_comments_and_other_lines() {
        let (store, registry) = setup().await;
        let custom = format!("{REGISTRY_HEADER}# keep me ;;;\nbroken line\nkeep;keep;\n");
        store
            .put_object(CFG, REGISTRY_OBJECT, Bytes::from(custom.clone()))
            .await
            .unwrap();

        registry.add(&VolumeDefinition::new("a", "b")).await.unwrap();
        assert!(registry.remove("a").await.unwrap());
        assert_eq!(document(&store).await, custom);
        assert!(registry.find("a").await.unwrap_err().is_not_found());
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_unknown_is_idempotent() {
        let (store, registry) = setup().await;
        registry.add(&VolumeDefinition::new("a", "b")).await.unwrap();
        let before = document(&store).await;
        assert!(!registry.remove("zzz").await.unwrap());
        assert_eq!(document(&store).await, before);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped_not_repaired() {
        let (store, registry) = setup().await;
        let text = format!("{REGISTRY_HEADER}bad\na;b;\nx;y\n");
        store
            .put_object(CFG, REGISTRY_OBJECT, Bytes::from(text.clone()))
            .await
            .unwrap();
        let names: Vec<_> = registry
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.name)
            .collect();
        assert_eq!(names, vec!["a"]);
        assert_eq!(document(&store).await, text);
    }

    #[tokio::test]
    async fn missing_document_is_fatal() {
        let (store, registry) = setup().await;
        store.remove_object(CFG, REGISTRY_OBJECT).await.unwrap();
        assert!(matches!(
            registry.find("a").await,
            Err(VolError::ObjectNotFound { .. })
        ));
        assert!(registry.list().await.is_err());
    }

    #[tokio::test]
    async fn failed_sentinel_write_aborts_add() {
        let (store, registry) = setup().await;
        store.fail_next(StoreOp::PutObject, 1);
        let err = registry
            .add(&VolumeDefinition::new("a", "b"))
            .await
            .unwrap_err();
        assert!(matches!(err, VolError::Transport(_)));
        assert_eq!(document(&store).await, REGISTRY_HEADER);
    }

    #[tokio::test]
    async fn failed_registry_write_releases_lock() {
        let (store, registry) = setup().await;
        // First put is the sentinel, second the registry rewrite.
        store.fail_after(StoreOp::PutObject, 1, 1);
        let err = registry
            .add(&VolumeDefinition::new("a", "b"))
            .await
            .unwrap_err();
        assert!(matches!(err, VolError::Transport(_)));
        assert!(
            store
                .stat_object(CFG, &sentinel_key(REGISTRY_OBJECT))
                .await
                .is_err()
        );

        // Nothing is left behind that would block the retry.
        assert!(registry.add(&VolumeDefinition::new("a", "b")).await.unwrap());
    }

    #[tokio::test]
    async fn failed_registry_read_releases_lock() {
        let (store, registry) = setup().await;
        // First get is the lock poll, second the registry read.
        store.fail_after(StoreOp::GetObject, 1, 1);
        assert!(registry.remove("a").await.is_err());
        assert!(
            store
                .stat_object(CFG, &sentinel_key(REGISTRY_OBJECT))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn busy_registry_times_out() {
        let (store, registry) = setup().await;
        store
            .put_object(CFG, &sentinel_key(REGISTRY_OBJECT), Bytes::from("node-b"))
            .await
            .unwrap();
        let err = registry
            .add(&VolumeDefinition::new("a", "b"))
            .await
            .unwrap_err();
        assert!(matches!(err, VolError::LockTimeout { .. }));
        assert_eq!(document(&store).await, REGISTRY_HEADER);
        // The foreign sentinel is untouched.
        assert_eq!(
            store
                .get_object(CFG, &sentinel_key(REGISTRY_OBJECT))
                .await
                .unwrap(),
            "node-b"
        );
    }

    #[tokio::test]
    async fn concurrent_adds_in_one_process_are_serialized() {
        let (_store, registry) = setup().await;
        let registry = Arc::new(registry);
        let mut tasks = Vec::new();
        for i in 0..8 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                registry
                    .add(&VolumeDefinition::new(format!("v{i}"), format!("b{i}")))
                    .await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().unwrap());
        }
        assert_eq!(registry.list().await.unwrap().len(), 8);
    }
}
