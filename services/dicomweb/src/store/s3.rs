use super::{object_headers, ObjectStore, ObjectStoreError, ObjectVersion, StoredObject};
use crate::config::S3Config;
use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use std::collections::BTreeSet;
use tracing::{debug, info, instrument};

/// S3 (or S3-compatible) backend.
///
/// Each put is a single `PutObject`, which S3 applies atomically.
/// Compare-and-swap uses conditional writes: `If-Match` on the ETag read
/// earlier, or `If-None-Match: *` for first creation.
pub struct S3Store {
    client: S3Client,
    bucket: String,
    prefix: Option<String>,
}

impl S3Store {
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // MinIO, LocalStack and other compatible endpoints
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            prefix = ?config.prefix,
            "S3 object store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            prefix: config
                .prefix
                .as_deref()
                .map(|p| p.trim_matches('/').to_string())
                .filter(|p| !p.is_empty()),
        })
    }

    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix, key),
            None => key.to_string(),
        }
    }

    fn put_request(&self, key: &str, bytes: Bytes) -> aws_sdk_s3::operation::put_object::builders::PutObjectFluentBuilder {
        let (content_type, content_encoding) = object_headers(key);
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .body(ByteStream::from(bytes))
            .content_type(content_type);
        if let Some(encoding) = content_encoding {
            request = request.content_encoding(encoding);
        }
        request
    }
}

/// HTTP status of a failed call, when the service answered at all.
fn status<E>(err: &SdkError<E, aws_sdk_s3::config::http::HttpResponse>) -> Option<u16> {
    err.raw_response().map(|r| r.status().as_u16())
}

fn backend_error<E>(key: &str, err: SdkError<E, aws_sdk_s3::config::http::HttpResponse>) -> ObjectStoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    ObjectStoreError::Backend {
        key: key.to_string(),
        message: DisplayErrorContext(&err).to_string(),
    }
}

fn version_of(e_tag: Option<&str>) -> ObjectVersion {
    ObjectVersion(e_tag.unwrap_or_default().to_string())
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn get(&self, key: &str) -> Result<StoredObject, ObjectStoreError> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    return Err(ObjectStoreError::NotFound {
                        key: key.to_string(),
                    });
                }
                return Err(backend_error(key, e));
            }
        };

        let version = version_of(response.e_tag());
        let body = response
            .body
            .collect()
            .await
            .map_err(|e| ObjectStoreError::Backend {
                key: key.to_string(),
                message: e.to_string(),
            })?;

        Ok(StoredObject {
            bytes: body.into_bytes(),
            version,
        })
    }

    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    async fn put(&self, key: &str, bytes: Bytes) -> Result<ObjectVersion, ObjectStoreError> {
        let response = self
            .put_request(key, bytes)
            .send()
            .await
            .map_err(|e| backend_error(key, e))?;

        debug!(key = %key, "Object uploaded");
        Ok(version_of(response.e_tag()))
    }

    #[instrument(skip(self, bytes, expected), fields(size = bytes.len()))]
    async fn put_if(
        &self,
        key: &str,
        bytes: Bytes,
        expected: Option<&ObjectVersion>,
    ) -> Result<ObjectVersion, ObjectStoreError> {
        let request = match expected {
            Some(version) => self.put_request(key, bytes).if_match(&version.0),
            None => self.put_request(key, bytes).if_none_match("*"),
        };

        match request.send().await {
            Ok(response) => Ok(version_of(response.e_tag())),
            // 412 when the precondition fails, 409 when a concurrent
            // conditional write is in flight
            Err(e) if matches!(status(&e), Some(412) | Some(409)) => {
                debug!(key = %key, "Conditional write rejected");
                Err(ObjectStoreError::Conflict {
                    key: key.to_string(),
                })
            }
            Err(e) => Err(backend_error(key, e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let dir = format!("{}/", self.full_key(prefix.trim_end_matches('/')));
        let mut names = BTreeSet::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&dir)
                .delimiter("/")
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| backend_error(prefix, e))?;

            for common in response.common_prefixes() {
                if let Some(name) = common.prefix().and_then(|p| p.strip_prefix(&dir)) {
                    names.insert(name.trim_end_matches('/').to_string());
                }
            }
            for object in response.contents() {
                if let Some(name) = object.key().and_then(|k| k.strip_prefix(&dir)) {
                    names.insert(name.to_string());
                }
            }

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(names.into_iter().filter(|n| !n.is_empty()).collect())
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| backend_error(key, e))?;

        debug!(key = %key, "Object deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store(prefix: Option<&str>) -> S3Store {
        S3Store::new(&S3Config {
            bucket: "dicomweb-test".to_string(),
            region: "us-east-1".to_string(),
            endpoint_url: Some("http://127.0.0.1:9".to_string()),
            force_path_style: true,
            prefix: prefix.map(str::to_string),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_full_key_applies_prefix() {
        assert_eq!(store(None).await.full_key("studies/1"), "studies/1");
        assert_eq!(store(Some("/archive/")).await.full_key("studies/1"), "archive/studies/1");
        assert_eq!(store(Some("")).await.full_key("studies/1"), "studies/1");
    }

    #[test]
    fn test_object_headers() {
        assert_eq!(
            object_headers("studies/1/index.json.zst"),
            ("application/dicom+json", Some("zstd"))
        );
        assert_eq!(object_headers("studies/1/bulkdata/2/00091001.zst").1, Some("zstd"));
        assert_eq!(object_headers("studies/1/thumbnail").0, "image/jpeg");
        assert_eq!(object_headers("studies/1/series/2/instances/3/frames/1.lz4").1, None);
    }
}
