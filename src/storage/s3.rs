//! S3 provider using the AWS SDK.
//!
//! ## Uploads
//!
//! The archive length is unknown until the encoder finishes, so uploads read the input in
//! `part_size` pieces:
//!
//! - if the stream ends before the first part is full, the object is sent with one `PutObject`
//! - otherwise a multipart upload is started and parts are uploaded in the background, at most
//!   `max_in_flight` at a time, while the next part is being read
//! - any failure (a read error from the input, a failed part, the deadline) aborts the
//!   multipart upload, so no partial object is ever committed
//!
//! Memory stays at roughly `(max_in_flight + 1) * part_size`.
//!
//! ## S3-compatible services
//!
//! MinIO, Cloudflare R2, LocalStack and friends work through
//! [`S3Settings::endpoint_url`](crate::config::S3Settings) and `force_path_style`.

use super::{
    ListOptions, ObjectReader, StorageObject, StorageProvider, StorageResult, UploadOptions,
    UploadResult,
};
use crate::config::{S3Settings, MAX_PARTS, MAX_PART_SIZE, MIN_PART_SIZE};
use crate::error::StorageError;
use crate::location::Scheme;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::io;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::task::JoinSet;

/// S3 list calls return at most this many keys per page
const LIST_PAGE_SIZE: usize = 1000;

/// S3-backed [`StorageProvider`]
#[derive(Clone)]
pub struct S3Provider {
    client: Client,
    part_size: usize,
    max_in_flight: usize,
    upload_timeout: Option<Duration>,
}

/// Builder for [`S3Provider`]
pub struct S3ProviderBuilder {
    client: Option<Client>,
    settings: S3Settings,
    part_size: usize,
    max_in_flight: usize,
    upload_timeout: Option<Duration>,
}

impl S3Provider {
    /// Provider over an existing client with default upload settings.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            part_size: MIN_PART_SIZE,
            max_in_flight: 4,
            upload_timeout: None,
        }
    }

    pub fn builder() -> S3ProviderBuilder {
        S3ProviderBuilder {
            client: None,
            settings: S3Settings::default(),
            part_size: MIN_PART_SIZE,
            max_in_flight: 4,
            upload_timeout: None,
        }
    }

    async fn put_single(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        options: &UploadOptions,
    ) -> StorageResult<UploadResult> {
        let size = data.len() as u64;
        let mut request = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data));
        if let Some(content_type) = &options.content_type {
            request = request.content_type(content_type);
        }
        if !options.metadata.is_empty() {
            request = request.set_metadata(Some(options.metadata.clone()));
        }

        let response = request
            .send()
            .await
            .map_err(|e| sdk_error("PutObject", e))?;

        Ok(UploadResult {
            key: key.to_string(),
            location: format!("s3://{}/{}", bucket, key),
            etag: response.e_tag().map(str::to_string),
            version_id: response.version_id().map(str::to_string),
            url: None,
            size,
        })
    }

    async fn put_multipart(
        &self,
        bucket: &str,
        key: &str,
        first_part: Bytes,
        reader: &mut ObjectReader,
        options: &UploadOptions,
        deadline: Option<Instant>,
    ) -> StorageResult<UploadResult> {
        let mut request = self.client.create_multipart_upload().bucket(bucket).key(key);
        if let Some(content_type) = &options.content_type {
            request = request.content_type(content_type);
        }
        if !options.metadata.is_empty() {
            request = request.set_metadata(Some(options.metadata.clone()));
        }
        let response = within(
            deadline,
            self.upload_timeout,
            "CreateMultipartUpload",
            async { request.send().await.map_err(|e| sdk_error("CreateMultipartUpload", e)) },
        )
        .await?;
        let upload_id = response
            .upload_id()
            .ok_or_else(|| {
                StorageError::operation("CreateMultipartUpload", "no upload_id returned")
            })?
            .to_string();

        tracing::debug!(
            bucket = %bucket,
            key = %key,
            upload_id = %upload_id,
            "Multipart upload started"
        );

        let result = async {
            let (parts, size) = within(
                deadline,
                self.upload_timeout,
                "UploadPart",
                self.upload_parts(bucket, key, &upload_id, first_part, reader),
            )
            .await?;
            let part_count = parts.len();

            let response = within(deadline, self.upload_timeout, "CompleteMultipartUpload", async {
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
                    .map_err(|e| sdk_error("CompleteMultipartUpload", e))
            })
            .await?;

            tracing::debug!(
                bucket = %bucket,
                key = %key,
                parts = part_count,
                "Multipart upload completed"
            );
            Ok::<UploadResult, StorageError>(UploadResult {
                key: key.to_string(),
                location: format!("s3://{}/{}", bucket, key),
                etag: response.e_tag().map(str::to_string),
                version_id: response.version_id().map(str::to_string),
                url: None,
                size,
            })
        }
        .await;

        if let Err(e) = &result {
            tracing::warn!(
                error = %e,
                bucket = %bucket,
                key = %key,
                upload_id = %upload_id,
                "Aborting multipart upload"
            );
            if let Err(abort_err) = self
                .client
                .abort_multipart_upload()
                .bucket(bucket)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                tracing::error!(
                    error = %DisplayErrorContext(&abort_err),
                    upload_id = %upload_id,
                    "Failed to abort multipart upload, parts left for lifecycle cleanup"
                );
            }
        }
        result
    }

    /// Upload `first_part` and every following part of `reader`, keeping at most
    /// `max_in_flight` parts in the air. Returns the parts sorted by number.
    async fn upload_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        first_part: Bytes,
        reader: &mut ObjectReader,
    ) -> StorageResult<(Vec<CompletedPart>, u64)> {
        let mut in_flight = JoinSet::new();
        let mut completed = Vec::new();
        let mut total = 0u64;
        let mut part_number = 0usize;
        let mut next = Some(first_part);

        while let Some(data) = next.take() {
            part_number += 1;
            if part_number > MAX_PARTS {
                return Err(StorageError::operation(
                    "UploadPart",
                    format!(
                        "archive exceeds {} parts of {} bytes; raise the part size",
                        MAX_PARTS, self.part_size
                    ),
                ));
            }
            while in_flight.len() >= self.max_in_flight {
                completed.push(join_part(&mut in_flight).await?);
            }

            total += data.len() as u64;
            in_flight.spawn(upload_part(
                self.client.clone(),
                bucket.to_string(),
                key.to_string(),
                upload_id.to_string(),
                part_number as i32,
                data,
            ));

            let data = read_part(reader, self.part_size)
                .await
                .map_err(|e| StorageError::operation("ReadArchive", e))?;
            if !data.is_empty() {
                next = Some(data);
            }
        }

        while !in_flight.is_empty() {
            completed.push(join_part(&mut in_flight).await?);
        }
        completed.sort_by_key(|part| part.part_number());
        Ok((completed, total))
    }
}

impl S3ProviderBuilder {
    /// Use an existing client instead of loading one from the environment.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Region, endpoint and addressing overrides.
    pub fn settings(mut self, settings: S3Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Multipart part size, 5MB to 5GB.
    pub fn part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size;
        self
    }

    /// Maximum number of parts uploading at once.
    pub fn max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    /// Deadline for a whole upload, including completion.
    pub fn upload_timeout(mut self, timeout: Duration) -> Self {
        self.upload_timeout = Some(timeout);
        self
    }

    /// Build the provider, loading AWS configuration when no client was given.
    pub async fn build(self) -> StorageResult<S3Provider> {
        if !(MIN_PART_SIZE..=MAX_PART_SIZE).contains(&self.part_size) {
            return Err(StorageError::operation(
                "Configure",
                format!("part size must be between 5MB and 5GB, got {}", self.part_size),
            ));
        }

        let client = match self.client {
            Some(client) => client,
            None => {
                let mut loader = aws_config::defaults(BehaviorVersion::latest());
                if let Some(region) = &self.settings.region {
                    loader = loader.region(Region::new(region.clone()));
                }
                if let Some(endpoint) = &self.settings.endpoint_url {
                    loader = loader.endpoint_url(endpoint);
                }
                let shared = loader.load().await;
                let config = aws_sdk_s3::config::Builder::from(&shared)
                    .force_path_style(self.settings.force_path_style)
                    .build();
                Client::from_conf(config)
            }
        };

        Ok(S3Provider {
            client,
            part_size: self.part_size,
            max_in_flight: self.max_in_flight,
            upload_timeout: self.upload_timeout,
        })
    }
}

fn sdk_error<E, R>(operation: &'static str, err: SdkError<E, R>) -> StorageError
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    StorageError::operation(operation, DisplayErrorContext(&err))
}

fn to_chrono(timestamp: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(timestamp.secs(), timestamp.subsec_nanos())
}

/// Run `fut` under the upload deadline, if there is one.
async fn within<T, F>(
    deadline: Option<Instant>,
    after: Option<Duration>,
    operation: &'static str,
    fut: F,
) -> StorageResult<T>
where
    F: Future<Output = StorageResult<T>>,
{
    match (deadline, after) {
        (Some(deadline), Some(after)) => {
            tokio::time::timeout_at(deadline.into(), fut)
                .await
                .map_err(|_| StorageError::Timeout { operation, after })?
        }
        _ => fut.await,
    }
}

/// Fill one part from `reader`; shorter than `part_size` only at end of stream.
async fn read_part(reader: &mut ObjectReader, part_size: usize) -> io::Result<Bytes> {
    let mut buffer = vec![0u8; part_size];
    let mut filled = 0;
    while filled < part_size {
        let n = reader.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buffer.truncate(filled);
    Ok(Bytes::from(buffer))
}

async fn upload_part(
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    part_number: i32,
    data: Bytes,
) -> StorageResult<CompletedPart> {
    let size = data.len();
    let start = Instant::now();
    let response = client
        .upload_part()
        .bucket(&bucket)
        .key(&key)
        .upload_id(&upload_id)
        .part_number(part_number)
        .body(ByteStream::from(data))
        .send()
        .await
        .map_err(|e| sdk_error("UploadPart", e))?;

    let etag = response.e_tag().ok_or_else(|| {
        StorageError::operation(
            "UploadPart",
            format!("no ETag returned for part {}", part_number),
        )
    })?;

    tracing::debug!(
        bucket = %bucket,
        key = %key,
        part_number,
        size_bytes = size,
        duration_ms = start.elapsed().as_secs_f64() * 1000.0,
        "Part uploaded"
    );

    Ok(CompletedPart::builder()
        .part_number(part_number)
        .e_tag(etag)
        .build())
}

async fn join_part(
    in_flight: &mut JoinSet<StorageResult<CompletedPart>>,
) -> StorageResult<CompletedPart> {
    match in_flight.join_next().await {
        Some(Ok(result)) => result,
        Some(Err(e)) => Err(StorageError::operation(
            "UploadPart",
            format!("upload task failed: {}", e),
        )),
        None => Err(StorageError::operation("UploadPart", "no part in flight")),
    }
}

#[async_trait]
impl StorageProvider for S3Provider {
    fn scheme(&self) -> Scheme {
        Scheme::ObjectStore
    }

    async fn list_objects(
        &self,
        container: &str,
        options: &ListOptions,
    ) -> StorageResult<Vec<StorageObject>> {
        let start = Instant::now();
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(container)
                .set_continuation_token(continuation.take());
            if !options.prefix.is_empty() {
                request = request.prefix(&options.prefix);
            }
            if let Some(max) = options.max_keys {
                let remaining = max.saturating_sub(objects.len()).min(LIST_PAGE_SIZE);
                request = request.max_keys(remaining as i32);
            }

            let response = request
                .send()
                .await
                .map_err(|e| sdk_error("ListObjectsV2", e))?;

            objects.extend(response.contents().iter().map(|object| StorageObject {
                key: object.key().unwrap_or_default().to_string(),
                size: object.size().map(|size| size.max(0) as u64),
                last_modified: object.last_modified().and_then(to_chrono),
                etag: object.e_tag().map(str::to_string),
            }));

            if options.max_keys.is_some_and(|max| objects.len() >= max) {
                break;
            }
            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        if let Some(max) = options.max_keys {
            objects.truncate(max);
        }

        tracing::debug!(
            bucket = %container,
            prefix = %options.prefix,
            count = objects.len(),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Listed S3 objects"
        );
        Ok(objects)
    }

    async fn get_object_stream(&self, container: &str, key: &str) -> StorageResult<ObjectReader> {
        match self.client.get_object().bucket(container).key(key).send().await {
            Ok(response) => Ok(Box::new(Box::pin(response.body.into_async_read()))),
            Err(SdkError::ServiceError(e)) if e.err().is_no_such_key() => {
                Err(StorageError::not_found(container, key))
            }
            Err(e) => Err(sdk_error("GetObject", e)),
        }
    }

    async fn upload_object(
        &self,
        container: &str,
        key: &str,
        mut reader: ObjectReader,
        options: &UploadOptions,
    ) -> StorageResult<UploadResult> {
        let start = Instant::now();
        let deadline = self.upload_timeout.map(|after| start + after);

        let first_part = within(deadline, self.upload_timeout, "ReadArchive", async {
            read_part(&mut reader, self.part_size)
                .await
                .map_err(|e| StorageError::operation("ReadArchive", e))
        })
        .await?;

        let result = if first_part.len() < self.part_size {
            within(
                deadline,
                self.upload_timeout,
                "PutObject",
                self.put_single(container, key, first_part, options),
            )
            .await
        } else {
            self.put_multipart(container, key, first_part, &mut reader, options, deadline)
                .await
        };

        match &result {
            Ok(uploaded) => tracing::info!(
                bucket = %container,
                key = %key,
                size_bytes = uploaded.size,
                duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                "S3 upload successful"
            ),
            Err(e) => tracing::error!(
                error = %e,
                bucket = %container,
                key = %key,
                duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                "S3 upload failed"
            ),
        }
        result
    }

    async fn delete_object(&self, container: &str, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(container)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_error("DeleteObject", e))?;
        tracing::debug!(bucket = %container, key = %key, "S3 object deleted");
        Ok(())
    }

    async fn object_exists(&self, container: &str, key: &str) -> StorageResult<bool> {
        match self.client.head_object().bucket(container).key(key).send().await {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(e)) if e.err().is_not_found() => Ok(false),
            Err(e) => Err(sdk_error("HeadObject", e)),
        }
    }

    async fn get_object_url(
        &self,
        container: &str,
        key: &str,
        expires_in: Duration,
    ) -> StorageResult<String> {
        let presigning = PresigningConfig::expires_in(expires_in)
            .map_err(|e| StorageError::operation("PresignGetObject", e))?;
        let request = self
            .client
            .get_object()
            .bucket(container)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| sdk_error("PresignGetObject", e))?;
        Ok(request.uri().to_string())
    }

    async fn create_container(&self, container: &str) -> StorageResult<()> {
        // Buckets are provisioned out of band.
        tracing::debug!(bucket = %container, "Skipping bucket creation for S3");
        Ok(())
    }
}
