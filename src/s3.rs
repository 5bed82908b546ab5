use crate::config::S3Config;
use crate::storage::{BlobStore, StorageError, StoredObject};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ObjectCannedAcl;
use axum::body::Body;
use bytes::Bytes;
use tokio_util::io::ReaderStream;
use tracing::info;

const CREDENTIALS_PROVIDER: &str = "imgcache-env";

/// S3-compatible bucket. With a custom endpoint this also covers DigitalOcean
/// Spaces, MinIO and the GCS XML interoperability API.
pub struct S3BlobStore {
    client: Client,
    bucket: String,
}

impl S3BlobStore {
    pub fn new(config: &S3Config) -> Self {
        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            CREDENTIALS_PROVIDER,
        );
        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(config.force_path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        info!(
            bucket = %config.bucket,
            region = %config.region,
            endpoint = config.endpoint.as_deref().unwrap_or("aws"),
            "s3 storage configured"
        );
        Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn exists(&self, name: &str) -> Result<bool, StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                let not_found = err
                    .as_service_error()
                    .is_some_and(|service| service.is_not_found())
                    || err
                        .raw_response()
                        .is_some_and(|response| response.status().as_u16() == 404);
                if not_found {
                    Ok(false)
                } else {
                    Err(StorageError::Backend(
                        DisplayErrorContext(&err).to_string(),
                    ))
                }
            }
        }
    }

    async fn read(&self, name: &str) -> Result<StoredObject, StorageError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .is_some_and(|service| service.is_no_such_key())
                {
                    StorageError::NotFound(name.to_string())
                } else {
                    StorageError::Backend(DisplayErrorContext(&err).to_string())
                }
            })?;
        Ok(StoredObject {
            content_type: output.content_type().map(str::to_string),
            content_length: output
                .content_length()
                .and_then(|length| u64::try_from(length).ok()),
            body: streaming_body(output.body),
        })
    }

    async fn write(
        &self,
        name: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(name)
            .acl(ObjectCannedAcl::PublicRead)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|err| StorageError::Backend(DisplayErrorContext(&err).to_string()))?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "s3"
    }
}

fn streaming_body(body: ByteStream) -> Body {
    Body::from_stream(ReaderStream::new(body.into_async_read()))
}
