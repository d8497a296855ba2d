//! End-to-end lifecycle tests: two hosts sharing one directory-backed store.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use libs3vol::lock::sentinel_key;
use libs3vol::mount::HelperCall;
use libs3vol::registry::{REGISTRY_HEADER, REGISTRY_OBJECT};
use libs3vol::store::{DirStore, ObjectStore};
use libs3vol::{DriverConfig, DryRunHelper, LockConfig, S3Driver, VolError, VolumeLifecycle, options};

struct Host {
    driver: S3Driver,
    helper: Arc<DryRunHelper>,
}

async fn host(store: Arc<DirStore>, identity: &str, root: &Path) -> Host {
    let config = DriverConfig {
        root_mount: root.to_path_buf(),
        defaults: options::parse("allow_other").unwrap(),
        lock: LockConfig {
            interval: Duration::from_millis(2),
            max_attempts: 10,
            identity: identity.to_owned(),
        },
        ..Default::default()
    };
    let helper = Arc::new(DryRunHelper::new());
    let driver = S3Driver::new(config, store, helper.clone()).await.unwrap();
    Host { driver, helper }
}

#[tokio::test]
async fn volumes_are_shared_between_hosts() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(DirStore::open(tmp.path().join("store")).await.unwrap());
    let a = host(store.clone(), "host-a", &tmp.path().join("a")).await;
    let b = host(store.clone(), "host-b", &tmp.path().join("b")).await;

    a.driver
        .create("photos", options::parse("ro,uid=1000").unwrap())
        .await
        .unwrap();

    let seen = b.driver.list().await.unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].name, "photos");
    assert!(!seen[0].created_at.is_empty());

    let body = store.get_object("s3vol", REGISTRY_OBJECT).await.unwrap();
    assert_eq!(
        String::from_utf8(body.to_vec()).unwrap(),
        format!("{REGISTRY_HEADER}photos;photos;ro,uid=1000\n")
    );

    // Refcounts are per host.
    let path = b.driver.mount("photos", "c1").await.unwrap();
    assert_eq!(Path::new(&path), tmp.path().join("b/photos"));
    assert_eq!(b.driver.get("photos").await.unwrap().mounts, 1);
    assert_eq!(a.driver.get("photos").await.unwrap().mounts, 0);
    assert_eq!(
        b.helper.calls(),
        vec![HelperCall::Mount {
            bucket: "photos".into(),
            target: tmp.path().join("b/photos"),
            options: "allow_other,ro,uid=1000".into(),
        }]
    );
    assert!(a.helper.calls().is_empty());

    // Host A may remove it even though B still has it mounted.
    a.driver.remove("photos").await.unwrap();
    assert!(b.driver.list().await.unwrap().is_empty());
    b.driver.unmount("photos", "c1").await.unwrap();
    assert_eq!(b.helper.unmounts(), 1);
}

#[tokio::test]
async fn busy_registry_times_out_and_recovers() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(DirStore::open(tmp.path().join("store")).await.unwrap());
    let a = host(store.clone(), "host-a", &tmp.path().join("a")).await;

    // A crashed host left its sentinel behind.
    let sentinel = sentinel_key(REGISTRY_OBJECT);
    store
        .put_object("s3vol", &sentinel, Bytes::from("host-z"))
        .await
        .unwrap();

    let err = a.driver.create("v", Default::default()).await.unwrap_err();
    assert!(
        matches!(err, VolError::LockTimeout { ref holder, .. } if holder == "host-z"),
        "{err:?}"
    );
    assert!(err.is_retryable());
    // Reads do not take the lock.
    assert!(a.driver.list().await.unwrap().is_empty());

    store.remove_object("s3vol", &sentinel).await.unwrap();
    a.driver.create("v", Default::default()).await.unwrap();
    assert_eq!(a.driver.list().await.unwrap().len(), 1);
    assert!(store.stat_object("s3vol", &sentinel).await.is_err());
}

#[tokio::test]
async fn hand_edited_registry_is_tolerated() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(DirStore::open(tmp.path().join("store")).await.unwrap());
    store.make_bucket("s3vol", "us-east-1").await.unwrap();
    let document = "# s3vol configuration\n# volumename;bucket;options\n\
                    logs;logs-bucket;\n\
                    broken line\n\
                    # keep me\n\
                    cache;cache;use_cache=/tmp\n";
    store
        .put_object("s3vol", REGISTRY_OBJECT, Bytes::from(document))
        .await
        .unwrap();

    let a = host(store.clone(), "host-a", &tmp.path().join("a")).await;
    let names: Vec<String> = a
        .driver
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|v| v.name)
        .collect();
    assert_eq!(names, vec!["logs", "cache"]);

    a.driver.remove("logs").await.unwrap();
    let body = store.get_object("s3vol", REGISTRY_OBJECT).await.unwrap();
    assert_eq!(
        String::from_utf8(body.to_vec()).unwrap(),
        "# s3vol configuration\n# volumename;bucket;options\n\
         broken line\n\
         # keep me\n\
         cache;cache;use_cache=/tmp\n"
    );

    a.driver.mount("cache", "c").await.unwrap();
    assert_eq!(
        a.helper.calls(),
        vec![HelperCall::Mount {
            bucket: "cache".into(),
            target: tmp.path().join("a/cache"),
            options: "allow_other,use_cache=/tmp".into(),
        }]
    );
}
