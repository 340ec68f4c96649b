//! Object storage: the upload seam and its aws-sdk-s3 implementation

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::{ByteStream, DateTime as S3DateTime};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, StorageClass};
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Per-object upload options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOptions {
    pub content_type: String,
    pub storage_class: Option<String>,
    /// Instant after which the object may be expired
    pub expires: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload exactly `size` bytes from `body` under `bucket/key`
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: &mut (dyn AsyncRead + Send + Unpin),
        size: u64,
        options: &PutOptions,
    ) -> Result<()>;
}

/// Connection settings for an S3-compatible endpoint
#[derive(Debug, Clone)]
pub struct S3Settings {
    /// Full endpoint URL; `None` uses the AWS default for the region
    pub endpoint_url: Option<String>,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Objects larger than this go through multipart upload, one part of this size at a time
    pub part_size: usize,
}

/// Smallest part size S3 accepts for all but the last part
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Default part size for multipart uploads
pub const DEFAULT_PART_SIZE: usize = 16 * 1024 * 1024;

pub struct S3Store {
    client: Client,
    part_size: usize,
}

impl S3Store {
    pub fn new(settings: S3Settings) -> Self {
        let credentials = Credentials::new(
            settings.access_key_id,
            settings.secret_access_key,
            None,
            None,
            "snapback-environment",
        );

        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(settings.region))
            .credentials_provider(credentials)
            .force_path_style(true);
        if let Some(endpoint) = settings.endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }

        Self {
            client: Client::from_conf(builder.build()),
            part_size: settings.part_size.max(MIN_PART_SIZE),
        }
    }

    async fn put_single(
        &self,
        bucket: &str,
        key: &str,
        body: &mut (dyn AsyncRead + Send + Unpin),
        size: u64,
        options: &PutOptions,
    ) -> Result<()> {
        let mut data = Vec::with_capacity(size as usize);
        body.read_to_end(&mut data)
            .await
            .context("Failed to read archive")?;

        let mut request = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(&options.content_type)
            .content_length(data.len() as i64)
            .body(ByteStream::from(data));
        if let Some(class) = &options.storage_class {
            request = request.storage_class(StorageClass::from(class.as_str()));
        }
        if let Some(expires) = options.expires {
            request = request.expires(S3DateTime::from_secs(expires.timestamp()));
        }

        request.send().await.context("PutObject failed")?;
        Ok(())
    }

    async fn put_multipart(
        &self,
        bucket: &str,
        key: &str,
        body: &mut (dyn AsyncRead + Send + Unpin),
        options: &PutOptions,
    ) -> Result<()> {
        let mut create = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .content_type(&options.content_type);
        if let Some(class) = &options.storage_class {
            create = create.storage_class(StorageClass::from(class.as_str()));
        }
        if let Some(expires) = options.expires {
            create = create.expires(S3DateTime::from_secs(expires.timestamp()));
        }

        let created = create.send().await.context("CreateMultipartUpload failed")?;
        let upload_id = created
            .upload_id()
            .context("CreateMultipartUpload returned no upload id")?
            .to_string();

        match self.upload_parts(bucket, key, &upload_id, body).await {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .context("CompleteMultipartUpload failed")?;
                Ok(())
            }
            Err(err) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    tracing::warn!(error = %abort_err, upload_id = %upload_id, "Failed to abort multipart upload");
                }
                Err(err)
            }
        }
    }

    /// Stream `body` part by part; only one part is held in memory at a time
    async fn upload_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        body: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        let mut part_number = 1;

        loop {
            let mut chunk = Vec::with_capacity(self.part_size);
            (&mut *body)
                .take(self.part_size as u64)
                .read_to_end(&mut chunk)
                .await
                .context("Failed to read archive")?;
            if chunk.is_empty() {
                break;
            }

            let uploaded = self
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .with_context(|| format!("UploadPart {} failed", part_number))?;

            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .build(),
            );
            part_number += 1;
        }

        Ok(parts)
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: &mut (dyn AsyncRead + Send + Unpin),
        size: u64,
        options: &PutOptions,
    ) -> Result<()> {
        if size <= self.part_size as u64 {
            self.put_single(bucket, key, body, size, options).await
        } else {
            self.put_multipart(bucket, key, body, options).await
        }
    }
}

/// Turn `host[:port]` into a URL, keeping explicit schemes as they are
pub fn endpoint_url(endpoint: &str, insecure: bool) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else if insecure {
        format!("http://{}", endpoint)
    } else {
        format!("https://{}", endpoint)
    }
}

/// Resolve `endpoint` with [`endpoint_url`] and check the result is an http(s) URL with a host
pub fn parse_endpoint(endpoint: &str, insecure: bool) -> Result<String, String> {
    let url = endpoint_url(endpoint, insecure);
    let invalid = || format!("not a valid URL: {:?}", endpoint);

    if endpoint.contains("://") && url != endpoint {
        return Err(invalid());
    }
    let parsed = reqwest::Url::parse(&url).map_err(|err| format!("{}: {}", invalid(), err))?;
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(invalid());
    }
    Ok(url)
}
