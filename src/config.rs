//! Archive run configuration
//!
//! `ArchiveConfig` carries already-resolved parameters. Nothing in the library reads the
//! environment; the CLI fills this struct from flags and env vars.

use crate::error::{Error, Result};
use std::time::Duration;

/// Minimum multipart part size (S3 minimum, except the last part)
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Maximum multipart part size (S3 maximum)
pub const MAX_PART_SIZE: usize = 5 * 1024 * 1024 * 1024;

/// Maximum number of parts in one multipart upload (S3 limit)
pub const MAX_PARTS: usize = 10_000;

/// Longest lifetime S3 accepts for a presigned URL
pub const MAX_URL_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const MAX_QUEUE_SIZE: usize = 16;

/// Connection settings for S3-compatible object stores
#[derive(Debug, Clone, Default)]
pub struct S3Settings {
    /// Region override; falls back to the SDK's default provider chain
    pub region: Option<String>,
    /// Custom endpoint (MinIO, R2, LocalStack, ...)
    pub endpoint_url: Option<String>,
    /// Use `endpoint/bucket/key` addressing instead of virtual-hosted buckets
    pub force_path_style: bool,
}

/// Configuration for one archive run
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// 0 stores entries, 1-9 deflate (default: 9)
    pub compression_level: u32,
    /// Multipart upload part size in bytes (default: 5MB)
    pub part_size: usize,
    /// In-flight upload parts, and queued archive entries (default: 4, max: 16)
    pub queue_size: usize,
    /// Deadline for the whole upload (default: none)
    pub upload_timeout: Option<Duration>,
    /// Lifetime of the access URL returned for object-store targets (default: 1 hour)
    pub url_expires_in: Duration,
    /// Size of the chunks passed from the encoder to the uploader (default: 64KB)
    pub chunk_size: usize,
    /// Object store connection settings
    pub s3: S3Settings,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            compression_level: 9,
            part_size: MIN_PART_SIZE,
            queue_size: 4,
            upload_timeout: None,
            url_expires_in: Duration::from_secs(60 * 60),
            chunk_size: 64 * 1024,
            s3: S3Settings::default(),
        }
    }
}

impl ArchiveConfig {
    /// Low-memory preset: minimum parts, two in flight
    pub fn conservative() -> Self {
        Self {
            queue_size: 2,
            ..Self::default()
        }
    }

    /// Throughput preset for large archives on fast links
    pub fn aggressive() -> Self {
        Self {
            part_size: 16 * 1024 * 1024,
            queue_size: 8,
            chunk_size: 256 * 1024,
            ..Self::default()
        }
    }

    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = level;
        self
    }

    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size;
        self
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    pub fn with_upload_timeout(mut self, timeout: Duration) -> Self {
        self.upload_timeout = Some(timeout);
        self
    }

    pub fn with_url_expires_in(mut self, expires_in: Duration) -> Self {
        self.url_expires_in = expires_in;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_s3(mut self, s3: S3Settings) -> Self {
        self.s3 = s3;
        self
    }

    /// Check every parameter against its allowed range.
    pub fn validate(&self) -> Result<()> {
        if self.compression_level > 9 {
            return Err(Error::Configuration(format!(
                "compression level must be 0-9, got {}",
                self.compression_level
            )));
        }
        if !(MIN_PART_SIZE..=MAX_PART_SIZE).contains(&self.part_size) {
            return Err(Error::Configuration(format!(
                "part size must be between 5MB and 5GB, got {} bytes",
                self.part_size
            )));
        }
        if !(1..=MAX_QUEUE_SIZE).contains(&self.queue_size) {
            return Err(Error::Configuration(format!(
                "queue size must be 1-{}, got {}",
                MAX_QUEUE_SIZE, self.queue_size
            )));
        }
        if self.chunk_size == 0 || self.chunk_size > self.part_size {
            return Err(Error::Configuration(format!(
                "chunk size must be between 1 byte and the part size, got {}",
                self.chunk_size
            )));
        }
        if self.url_expires_in.is_zero() || self.url_expires_in > MAX_URL_EXPIRY {
            return Err(Error::Configuration(format!(
                "URL expiry must be between 1 second and 7 days, got {:?}",
                self.url_expires_in
            )));
        }
        if self.upload_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::Configuration(
                "upload timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Most source streams a run holds open at once
    pub fn max_open_sources(&self) -> usize {
        2 * self.queue_size + 2
    }

    /// Rough upper bound on buffered bytes for one run, in MB
    pub fn estimated_peak_memory_mb(&self) -> usize {
        // Parts being uploaded plus the one being filled, the chunk channel, and one
        // read buffer per open source stream: `queue_size` opened ahead by the pipeline,
        // `queue_size` queued in the encoder, one being appended and one being encoded.
        let parts = (self.queue_size + 1) * self.part_size;
        let chunks = (self.queue_size + 1) * self.chunk_size;
        let readers = self.max_open_sources() * 64 * 1024;
        (parts + chunks + readers).div_ceil(1024 * 1024)
    }
}
