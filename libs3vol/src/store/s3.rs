//! S3-compatible network store.
//!
//! [`S3Store`] talks to MinIO, Ceph RGW, AWS S3 or any other server that
//! speaks the S3 API, using path-style addressing.  The endpoint scheme
//! decides transport security: `https://` uses TLS, `http://` does not.

use std::fmt;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{BehaviorVersion, Builder, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CreateBucketConfiguration, Delete, ObjectIdentifier,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use super::{ObjectStat, ObjectStore};
use crate::error::{Result, VolError};
use crate::types::BucketInfo;

/// Endpoint used when none is configured.
pub const DEFAULT_ENDPOINT: &str = "http://localhost:9000";

/// Region that must not be sent as a location constraint.
const US_EAST_1: &str = "us-east-1";

/// Upper bound of keys per `DeleteObjects` call.
const DELETE_BATCH: usize = 1000;

/// Connection settings for [`S3Store`].
#[derive(Clone, PartialEq, Eq)]
pub struct S3Config {
    /// `http://host[:port]` or `https://host[:port]`.
    pub endpoint: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_owned(),
            region: US_EAST_1.to_owned(),
            access_key: String::new(),
            secret_key: String::new(),
        }
    }
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

impl S3Config {
    /// Check the endpoint and credentials.  Returns whether the endpoint
    /// uses TLS.
    pub fn validate(&self) -> Result<bool> {
        let uri: hyper::Uri = self.endpoint.parse().map_err(|e| {
            VolError::InvalidArgument(format!("invalid endpoint {:?}: {e}", self.endpoint))
        })?;
        let tls = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            _ => {
                return Err(VolError::InvalidArgument(format!(
                    "endpoint {:?} must start with http:// or https://",
                    self.endpoint
                )));
            }
        };
        if uri.host().is_none_or(str::is_empty) {
            return Err(VolError::InvalidArgument(format!(
                "endpoint {:?} has no host",
                self.endpoint
            )));
        }
        if self.access_key.is_empty() || self.secret_key.is_empty() {
            return Err(VolError::InvalidArgument(
                "an access key and a secret key are required".to_owned(),
            ));
        }
        if self.region.is_empty() {
            return Err(VolError::InvalidArgument("region must not be empty".to_owned()));
        }
        Ok(tls)
    }
}

/// [`ObjectStore`] backed by an S3-compatible server.
#[derive(Debug, Clone)]
pub struct S3Store {
    client: Client,
    endpoint: String,
}

impl S3Store {
    /// Build a client for `config`.  No request is made until the first
    /// operation.
    pub fn new(config: &S3Config) -> Result<Self> {
        let tls = config.validate()?;
        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "s3vol",
        );
        let sdk = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .endpoint_url(config.endpoint.clone())
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        info!(endpoint = %config.endpoint, region = %config.region, tls, "s3 store configured");
        Ok(Self {
            client: Client::from_conf(sdk),
            endpoint: config.endpoint.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Service error code of a failed call, e.g. `NoSuchBucket`.
fn code<E: ProvideErrorMetadata, R>(err: &SdkError<E, R>) -> Option<&str> {
    err.as_service_error().and_then(ProvideErrorMetadata::code)
}

fn failed<E, R>(op: &str, target: &str, err: SdkError<E, R>) -> VolError
where
    E: std::error::Error + 'static,
    R: fmt::Debug,
{
    VolError::Transport(format!("{op} {target}: {}", DisplayErrorContext(&err)))
}

fn missing_bucket<E: ProvideErrorMetadata, R>(err: &SdkError<E, R>) -> bool {
    code(err) == Some("NoSuchBucket")
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self))]
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|s| s.is_not_found()) => Ok(false),
            Err(e) => Err(failed("head bucket", bucket, e)),
        }
    }

    #[instrument(skip(self))]
    async fn make_bucket(&self, bucket: &str, region: &str) -> Result<()> {
        let mut req = self.client.create_bucket().bucket(bucket);
        if region != US_EAST_1 {
            req = req.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region))
                    .build(),
            );
        }
        match req.send().await {
            Ok(_) => Ok(()),
            Err(e)
                if e
                    .as_service_error()
                    .is_some_and(|s| s.is_bucket_already_owned_by_you()) =>
            {
                debug!("bucket already owned by us");
                Ok(())
            }
            Err(e) => Err(failed("create bucket", bucket, e)),
        }
    }

    #[instrument(skip(self))]
    async fn remove_bucket(&self, bucket: &str) -> Result<()> {
        match self.client.delete_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(()),
            Err(e) if missing_bucket(&e) => Err(VolError::BucketNotFound(bucket.to_owned())),
            Err(e) => Err(failed("delete bucket", bucket, e)),
        }
    }

    async fn stat_object(&self, bucket: &str, key: &str) -> Result<ObjectStat> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(out) => Ok(ObjectStat {
                size: out
                    .content_length()
                    .and_then(|len| u64::try_from(len).ok())
                    .unwrap_or(0),
            }),
            Err(e) if e.as_service_error().is_some_and(|s| s.is_not_found()) => {
                Err(VolError::ObjectNotFound {
                    bucket: bucket.to_owned(),
                    key: key.to_owned(),
                })
            }
            Err(e) => Err(failed("head object", &format!("{bucket}/{key}"), e)),
        }
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let out = match self.client.get_object().bucket(bucket).key(key).send().await {
            Ok(out) => out,
            Err(e) if e.as_service_error().is_some_and(|s| s.is_no_such_key()) => {
                return Err(VolError::ObjectNotFound {
                    bucket: bucket.to_owned(),
                    key: key.to_owned(),
                });
            }
            Err(e) if missing_bucket(&e) => {
                return Err(VolError::BucketNotFound(bucket.to_owned()));
            }
            Err(e) => return Err(failed("get object", &format!("{bucket}/{key}"), e)),
        };
        let body = out.body.collect().await.map_err(|e| {
            VolError::Transport(format!("read object {bucket}/{key}: {e}"))
        })?;
        Ok(body.into_bytes())
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        match self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if missing_bucket(&e) => Err(VolError::BucketNotFound(bucket.to_owned())),
            Err(e) => Err(failed("put object", &format!("{bucket}/{key}"), e)),
        }
    }

    async fn remove_object(&self, bucket: &str, key: &str) -> Result<()> {
        match self.client.delete_object().bucket(bucket).key(key).send().await {
            Ok(_) => Ok(()),
            Err(e) if missing_bucket(&e) => Err(VolError::BucketNotFound(bucket.to_owned())),
            Err(e) => Err(failed("delete object", &format!("{bucket}/{key}"), e)),
        }
    }

    #[instrument(skip(self))]
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        recursive: bool,
    ) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(token.take());
            if !recursive {
                req = req.delimiter("/");
            }
            let out = match req.send().await {
                Ok(out) => out,
                Err(e) if missing_bucket(&e) => {
                    return Err(VolError::BucketNotFound(bucket.to_owned()));
                }
                Err(e) => return Err(failed("list objects", bucket, e)),
            };
            keys.extend(
                out.contents()
                    .iter()
                    .filter_map(|o| o.key().map(str::to_owned)),
            );
            keys.extend(
                out.common_prefixes()
                    .iter()
                    .filter_map(|p| p.prefix().map(str::to_owned)),
            );
            match out.next_continuation_token() {
                Some(next) => token = Some(next.to_owned()),
                None => break,
            }
        }
        keys.sort();
        Ok(keys)
    }

    #[instrument(skip(self, keys), fields(count = keys.len()))]
    async fn remove_objects(&self, bucket: &str, keys: &[String]) -> Result<()> {
        for batch in keys.chunks(DELETE_BATCH) {
            let objects = batch
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(VolError::internal)?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(VolError::internal)?;
            let out = match self
                .client
                .delete_objects()
                .bucket(bucket)
                .delete(delete)
                .send()
                .await
            {
                Ok(out) => out,
                Err(e) if missing_bucket(&e) => {
                    return Err(VolError::BucketNotFound(bucket.to_owned()));
                }
                Err(e) => return Err(failed("delete objects in", bucket, e)),
            };
            if let Some(first) = out.errors().first() {
                return Err(VolError::Transport(format!(
                    "could not delete {} of {} objects in {bucket}, first {}: {}",
                    out.errors().len(),
                    batch.len(),
                    first.key().unwrap_or_default(),
                    first.message().unwrap_or_default()
                )));
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_buckets(&self) -> Result<Vec<BucketInfo>> {
        let out = self
            .client
            .list_buckets()
            .send()
            .await
            .map_err(|e| failed("list", "buckets", e))?;
        let mut buckets: Vec<BucketInfo> = out
            .buckets()
            .iter()
            .filter_map(|b| {
                let name = b.name()?.to_owned();
                let created = b
                    .creation_date()
                    .and_then(|d| DateTime::<Utc>::from_timestamp(d.secs(), d.subsec_nanos()))
                    .unwrap_or_default();
                Some(BucketInfo { name, created })
            })
            .collect();
        buckets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(buckets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(endpoint: &str) -> S3Config {
        S3Config {
            endpoint: endpoint.to_owned(),
            access_key: "minio".to_owned(),
            secret_key: "minio-secret".to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn scheme_selects_tls() {
        assert_eq!(config("http://localhost:9000").validate(), Ok(false));
        assert_eq!(config("https://s3.example.com").validate(), Ok(true));
    }

    #[test]
    fn rejects_bad_endpoints_and_missing_keys() {
        for endpoint in ["localhost:9000", "ftp://host", "http://", "not a url"] {
            assert!(
                matches!(
                    config(endpoint).validate(),
                    Err(VolError::InvalidArgument(_))
                ),
                "{endpoint} accepted"
            );
        }
        let mut anonymous = config(DEFAULT_ENDPOINT);
        anonymous.secret_key.clear();
        assert!(anonymous.validate().is_err());
    }

    #[test]
    fn debug_hides_the_secret() {
        let shown = format!("{:?}", config(DEFAULT_ENDPOINT));
        assert!(shown.contains("minio"));
        assert!(!shown.contains("minio-secret"));
    }

    #[tokio::test]
    async fn builds_without_contacting_the_server() {
        let store = S3Store::new(&config("http://127.0.0.1:9")).unwrap();
        assert_eq!(store.endpoint(), "http://127.0.0.1:9");
        assert!(S3Store::new(&config("tcp://127.0.0.1:9")).is_err());
    }
}
