//! Storage backends behind one capability trait
//!
//! Two providers implement [`StorageProvider`]:
//!
//! - [`FilesystemProvider`](local::FilesystemProvider): a local directory tree (`file://`)
//! - [`S3Provider`](s3::S3Provider): S3 and S3-compatible stores such as MinIO and R2
//!   (`s3://`, requires the `cloud-s3` feature)
//!
//! Providers are selected by [`create_provider`] from the scheme of a parsed location and are
//! safe to share between runs.

pub mod local;

#[cfg(feature = "cloud-s3")]
pub mod s3;

use crate::config::ArchiveConfig;
use crate::error::{Result, StorageError};
use crate::location::Scheme;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;

pub use local::FilesystemProvider;

#[cfg(feature = "cloud-s3")]
pub use s3::{S3Provider, S3ProviderBuilder};

/// Result type for provider calls
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// A sequential byte stream opened on a stored object
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// One listed object
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageObject {
    /// Slash-separated key; directory markers end in `/`
    pub key: String,
    pub size: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
}

impl StorageObject {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            size: None,
            last_modified: None,
            etag: None,
        }
    }

    /// Keys ending in `/` mark folders and carry no data.
    pub fn is_directory_marker(&self) -> bool {
        self.key.ends_with('/')
    }
}

/// Filters for [`StorageProvider::list_objects`]
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Only keys starting with this string
    pub prefix: String,
    /// Stop after this many keys
    pub max_keys: Option<usize>,
}

impl ListOptions {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            max_keys: None,
        }
    }
}

/// Object attributes applied on upload
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl UploadOptions {
    /// Options for a ZIP archive object
    pub fn zip() -> Self {
        Self {
            content_type: Some("application/zip".to_string()),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A committed object
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadResult {
    pub key: String,
    /// Where the object lives (`s3://bucket/key` or a filesystem path)
    pub location: String,
    pub etag: Option<String>,
    pub version_id: Option<String>,
    /// Access URL, filled in by the pipeline after the upload
    pub url: Option<String>,
    /// Bytes written
    pub size: u64,
}

/// Capability interface shared by every storage backend
///
/// `container` is a bucket for object stores and a base directory for the filesystem.
/// Backend failures are wrapped in [`StorageError`] with the original message preserved.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Scheme this provider serves
    fn scheme(&self) -> Scheme;

    /// List objects under `options.prefix`. Directory markers may be included.
    async fn list_objects(
        &self,
        container: &str,
        options: &ListOptions,
    ) -> StorageResult<Vec<StorageObject>>;

    /// Open an object for sequential reading.
    ///
    /// Fails with [`StorageError::NotFound`] when the object does not exist.
    async fn get_object_stream(&self, container: &str, key: &str) -> StorageResult<ObjectReader>;

    /// Consume `reader` to EOF and commit it as `key`.
    ///
    /// The total length is not known upfront. A read error from `reader` must leave no
    /// committed object behind.
    async fn upload_object(
        &self,
        container: &str,
        key: &str,
        reader: ObjectReader,
        options: &UploadOptions,
    ) -> StorageResult<UploadResult>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete_object(&self, container: &str, key: &str) -> StorageResult<()>;

    /// Check for an object, returning `false` when it is missing.
    async fn object_exists(&self, container: &str, key: &str) -> StorageResult<bool>;

    /// URL for reading the object: presigned for object stores, `file://` for the filesystem.
    async fn get_object_url(
        &self,
        container: &str,
        key: &str,
        expires_in: Duration,
    ) -> StorageResult<String>;

    /// Create the container if it is absent.
    async fn create_container(&self, container: &str) -> StorageResult<()>;
}

/// Build the provider that serves `scheme`.
pub async fn create_provider(
    scheme: Scheme,
    config: &ArchiveConfig,
) -> Result<Arc<dyn StorageProvider>> {
    match scheme {
        Scheme::Filesystem => {
            let mut provider = FilesystemProvider::new();
            if let Some(timeout) = config.upload_timeout {
                provider = provider.with_upload_timeout(timeout);
            }
            Ok(Arc::new(provider))
        }
        #[cfg(feature = "cloud-s3")]
        Scheme::ObjectStore => {
            let mut builder = S3Provider::builder()
                .settings(config.s3.clone())
                .part_size(config.part_size)
                .max_in_flight(config.queue_size);
            if let Some(timeout) = config.upload_timeout {
                builder = builder.upload_timeout(timeout);
            }
            Ok(Arc::new(builder.build().await?))
        }
        #[cfg(not(feature = "cloud-s3"))]
        Scheme::ObjectStore => Err(crate::error::Error::Configuration(
            "s3:// locations require the cloud-s3 feature".to_string(),
        )),
    }
}
