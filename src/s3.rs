use std::fmt;
use std::io::{Read, Write};

use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::primitives::{ByteStream, DateTime};
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use chrono::{TimeZone, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::stream::{self, StreamExt};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::session::{LazyClient, Session};

/// Outcome of a conditional load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    Ok,
    NotExisting,
    PreconditionFailed,
}

impl ObjectState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectState::Ok => "ok",
            ObjectState::NotExisting => "not_existing",
            ObjectState::PreconditionFailed => "precondition_failed",
        }
    }
}

impl fmt::Display for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single bucket. Keys ending in `.gz` are compressed on store and
/// decompressed on load.
pub struct S3Bucket {
    session: Session,
    bucket_name: String,
    client: LazyClient<aws_sdk_s3::Client>,
}

impl S3Bucket {
    pub fn new(session: Session, bucket_name: impl Into<String>) -> Self {
        Self {
            session,
            bucket_name: bucket_name.into(),
            client: LazyClient::new(),
        }
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket_name
    }

    /// Loads `key` if it was not modified after `if_unmodified_since`
    /// (1900-01-01 when not given).
    pub async fn load_data(
        &self,
        key: &str,
        if_unmodified_since: Option<chrono::DateTime<Utc>>,
    ) -> Result<(Option<Vec<u8>>, ObjectState)> {
        let since = if_unmodified_since.unwrap_or_else(epoch_1900);
        let client = self.client.client(&self.session).await;

        let response = client
            .get_object()
            .bucket(&self.bucket_name)
            .key(key)
            .if_unmodified_since(DateTime::from_secs(since.timestamp()))
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                let state = err.as_service_error().and_then(|service_err| {
                    if service_err.is_no_such_key() {
                        Some(ObjectState::NotExisting)
                    } else {
                        state_from_code(service_err.code())
                    }
                });
                return match state {
                    Some(state) => {
                        debug!(
                            bucket = %self.bucket_name,
                            key,
                            %state,
                            "object not loaded"
                        );
                        Ok((None, state))
                    }
                    None => Err(Error::service("s3", err)),
                };
            }
        };

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| Error::service("s3", e))?
            .into_bytes()
            .to_vec();

        if is_gzip_key(key) {
            return Ok((Some(gunzip(&body)?), ObjectState::Ok));
        }
        Ok((Some(body), ObjectState::Ok))
    }

    /// Like [`S3Bucket::load_data`], decoding the content as UTF-8.
    pub async fn load_text(
        &self,
        key: &str,
        if_unmodified_since: Option<chrono::DateTime<Utc>>,
    ) -> Result<(Option<String>, ObjectState)> {
        let (data, state) = self.load_data(key, if_unmodified_since).await?;
        let text = data.map(String::from_utf8).transpose()?;
        Ok((text, state))
    }

    /// Loads several keys, at most `max_concurrent` at a time.
    ///
    /// Results come back in completion order, each paired with its key.
    pub async fn load_many<K>(
        &self,
        keys: impl IntoIterator<Item = K>,
        max_concurrent: usize,
    ) -> Vec<(String, Result<(Option<Vec<u8>>, ObjectState)>)>
    where
        K: Into<String>,
    {
        let loads = keys.into_iter().map(|key| {
            let key = key.into();
            async move {
                let loaded = self.load_data(&key, None).await;
                (key, loaded)
            }
        });

        stream::iter(loads)
            .buffer_unordered(max_concurrent.max(1))
            .collect()
            .await
    }

    /// Stores `data` under `key`, creating the bucket when it does not exist.
    pub async fn store_data(&self, key: &str, data: &[u8]) -> Result<()> {
        let body = if is_gzip_key(key) {
            gzip(data)?
        } else {
            data.to_vec()
        };

        match self.put(key, body.clone()).await {
            Err(PutFailure::NoSuchBucket(_)) => {
                self.create_bucket().await?;
                self.put(key, body).await.map_err(PutFailure::into_error)
            }
            other => other.map_err(PutFailure::into_error),
        }
    }

    pub async fn close(&self) {
        self.client.close().await;
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> std::result::Result<(), PutFailure> {
        let client = self.client.client(&self.session).await;
        client
            .put_object()
            .bucket(&self.bucket_name)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| {
                let missing_bucket =
                    err.as_service_error().and_then(|e| e.code()) == Some("NoSuchBucket");
                let err = Error::service("s3", err);
                if missing_bucket {
                    PutFailure::NoSuchBucket(err)
                } else {
                    PutFailure::Other(err)
                }
            })?;
        debug!(bucket = %self.bucket_name, key, "object stored");
        Ok(())
    }

    async fn create_bucket(&self) -> Result<()> {
        let region = self.session.region().to_string();
        info!(bucket = %self.bucket_name, %region, "bucket missing, creating it");

        let client = self.client.client(&self.session).await;
        client
            .create_bucket()
            .bucket(&self.bucket_name)
            .set_create_bucket_configuration(bucket_configuration(&region))
            .send()
            .await
            .map_err(|e| Error::service("s3", e))?;
        Ok(())
    }
}

enum PutFailure {
    NoSuchBucket(Error),
    Other(Error),
}

impl PutFailure {
    fn into_error(self) -> Error {
        match self {
            PutFailure::NoSuchBucket(err) | PutFailure::Other(err) => err,
        }
    }
}

/// `us-east-1` is the default location and S3 rejects it as a constraint.
fn bucket_configuration(region: &str) -> Option<CreateBucketConfiguration> {
    if region == "us-east-1" {
        return None;
    }
    Some(
        CreateBucketConfiguration::builder()
            .location_constraint(BucketLocationConstraint::from(region))
            .build(),
    )
}

fn epoch_1900() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(1900, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

fn state_from_code(code: Option<&str>) -> Option<ObjectState> {
    match code? {
        "NoSuchKey" => Some(ObjectState::NotExisting),
        "PreconditionFailed" => Some(ObjectState::PreconditionFailed),
        _ => None,
    }
}

pub(crate) fn is_gzip_key(key: &str) -> bool {
    key.len() > 3 && key.ends_with(".gz")
}

pub(crate) fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub(crate) fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut content = Vec::new();
    decoder.read_to_end(&mut content)?;
    Ok(content)
}
