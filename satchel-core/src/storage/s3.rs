// satchel-core/src/storage/s3.rs
//! S3-backed object store.
//!
//! Conditional writes use S3's `If-Match`/`If-None-Match` support on
//! `PutObject`; ETags are passed through verbatim. Errors are normalised per
//! the adapter contract: timeouts/dispatch failures are transient, modeled
//! not-found and precondition failures map to their kinds, everything else
//! is fatal.

use super::{
    ObjectBody, ObjectStore, ObjectStoreError, ObjectSummary, Precondition, StoreResult,
    JSON_CONTENT_TYPE,
};
use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;

/// SDK attempts per request before a transient failure surfaces
const TRANSIENT_RETRY_ATTEMPTS: u32 = 3;

/// Object store backed by an S3 bucket, all keys under `key_prefix`.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    key_prefix: String,
}

impl std::fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("bucket", &self.bucket)
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl S3ObjectStore {
    pub fn new(client: Client, bucket: impl Into<String>, key_prefix: impl Into<String>) -> Self {
        let mut key_prefix = key_prefix.into();
        if !key_prefix.is_empty() && !key_prefix.ends_with('/') {
            key_prefix.push('/');
        }
        S3ObjectStore {
            client,
            bucket: bucket.into(),
            key_prefix,
        }
    }

    /// Build a store from the ambient AWS environment.
    pub async fn from_env(bucket: impl Into<String>, key_prefix: impl Into<String>) -> Self {
        Self::new(client_from_env().await, bucket, key_prefix)
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn logical_key<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(&self.key_prefix).unwrap_or(key)
    }
}

/// S3 client from the ambient AWS environment. Transient failures are
/// retried by the SDK before they surface as `network` errors.
pub async fn client_from_env() -> Client {
    let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .retry_config(RetryConfig::standard().with_max_attempts(TRANSIENT_RETRY_ATTEMPTS))
        .load()
        .await;
    Client::new(&config)
}

/// HTTP status of a modeled service error, when there is one.
fn service_status<E>(err: &SdkError<E>) -> Option<u16> {
    match err {
        SdkError::ServiceError(ctx) => Some(ctx.raw().status().as_u16()),
        _ => None,
    }
}

/// Fallback classification for errors no operation-specific rule caught.
fn classify<E: std::fmt::Debug>(op: &str, key: &str, err: &SdkError<E>) -> ObjectStoreError {
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            ObjectStoreError::Transient(format!("{} {}: {:?}", op, key, err))
        }
        _ => ObjectStoreError::Fatal(format!("{} {}: {:?}", op, key, err)),
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, key: &str) -> StoreResult<ObjectBody> {
        let full_key = self.full_key(key);
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                    || service_status(&err) == Some(404)
                {
                    ObjectStoreError::NotFound
                } else {
                    classify("get", key, &err)
                }
            })?;

        let etag = output.e_tag().unwrap_or_default().to_string();
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|err| ObjectStoreError::Transient(format!("get {}: {:?}", key, err)))?
            .into_bytes();

        Ok(ObjectBody { bytes, etag })
    }

    async fn get_if_none_match(&self, key: &str, etag: &str) -> StoreResult<Option<ObjectBody>> {
        let full_key = self.full_key(key);
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .if_none_match(etag)
            .send()
            .await;

        match result {
            Ok(output) => {
                let etag = output.e_tag().unwrap_or_default().to_string();
                let bytes = output
                    .body
                    .collect()
                    .await
                    .map_err(|err| {
                        ObjectStoreError::Transient(format!("get {}: {:?}", key, err))
                    })?
                    .into_bytes();
                Ok(Some(ObjectBody { bytes, etag }))
            }
            Err(err) if service_status(&err) == Some(304) => Ok(None),
            Err(err) => {
                if err
                    .as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                    || service_status(&err) == Some(404)
                {
                    Err(ObjectStoreError::NotFound)
                } else {
                    Err(classify("get", key, &err))
                }
            }
        }
    }

    async fn put(&self, key: &str, body: Bytes, precondition: Precondition) -> StoreResult<String> {
        let full_key = self.full_key(key);
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .content_type(JSON_CONTENT_TYPE)
            .body(ByteStream::from(body));

        match &precondition {
            Precondition::None => {}
            Precondition::IfMatch(etag) => {
                request = request.if_match(etag);
            }
            Precondition::IfNoneMatch => {
                request = request.if_none_match("*");
            }
        }

        let output = request.send().await.map_err(|err| {
            match service_status(&err) {
                // 412 for If-Match failures; S3 reports lost If-None-Match
                // races on in-flight writes as 409
                Some(412) | Some(409) => ObjectStoreError::PreconditionFailed,
                _ => classify("put", key, &err),
            }
        })?;

        Ok(output.e_tag().unwrap_or_default().to_string())
    }

    async fn head(&self, key: &str) -> StoreResult<Option<String>> {
        let full_key = self.full_key(key);
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await;

        match result {
            Ok(output) => Ok(Some(output.e_tag().unwrap_or_default().to_string())),
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                    || service_status(&err) == Some(404) =>
            {
                Ok(None)
            }
            Err(err) => Err(classify("head", key, &err)),
        }
    }

    async fn list(&self, prefix: &str, delimiter: Option<&str>) -> StoreResult<Vec<ObjectSummary>> {
        let full_prefix = self.full_key(prefix);
        let mut result = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix);
            if let Some(delim) = delimiter {
                request = request.delimiter(delim);
            }
            if let Some(token) = &continuation {
                request = request.continuation_token(token);
            }

            let output = request
                .send()
                .await
                .map_err(|err| classify("list", prefix, &err))?;

            for object in output.contents() {
                let Some(key) = object.key() else { continue };
                result.push(ObjectSummary {
                    key: self.logical_key(key).to_string(),
                    etag: object.e_tag().unwrap_or_default().to_string(),
                });
            }

            if output.is_truncated().unwrap_or(false) {
                continuation = output.next_continuation_token().map(str::to_string);
                if continuation.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        Ok(result)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        // S3 deletes are blind; report existence from a preceding head
        let existed = self.head(key).await?.is_some();
        let full_key = self.full_key(key);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|err| classify("delete", key, &err))?;
        Ok(existed)
    }
}
