//! # s-zip-pipe: Streaming ZIP Archives Between Storage Backends
//!
//! `s-zip-pipe` lists the objects under a source location, compresses them into one ZIP
//! archive on the fly and uploads the archive to a target location, without holding whole
//! files or the whole archive in memory.
//!
//! ## Features
//!
//! - **Streaming end to end**: the upload starts before the first file finishes downloading
//! - **Constant memory**: every stage is joined by a bounded queue, so a slow target slows
//!   the source reads instead of growing buffers
//! - **Any mix of backends**: `file://` and `s3://` (MinIO, R2 and other S3-compatible stores)
//! - **Partial-failure policy**: a file that cannot be read is skipped and reported; the run
//!   fails only when nothing could be archived
//! - **No broken objects**: a failed run aborts the multipart upload (or removes the temporary
//!   file) instead of committing a truncated archive
//!
//! ## Quick Start
//!
//! ```no_run
//! use s_zip_pipe::{archive, ArchiveConfig};
//!
//! # async fn example() -> s_zip_pipe::Result<()> {
//! let config = ArchiveConfig::default().with_compression_level(9);
//! let result = archive("s3://photos/2024/", "file://./backups/photos-2024.zip", &config).await?;
//!
//! println!(
//!     "{} of {} files archived, {} bytes",
//!     result.files_count, result.listed_count, result.archive_size
//! );
//! if result.is_partial() {
//!     eprintln!("missing: {:?}", result.failed_keys);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Writing a ZIP to any `AsyncWrite`
//!
//! The codec underneath is usable on its own:
//!
//! ```no_run
//! use s_zip_pipe::ZipStreamWriter;
//!
//! # async fn example() -> s_zip_pipe::Result<()> {
//! let mut zip = ZipStreamWriter::new(Vec::new(), 6);
//! zip.start_entry("hello.txt", chrono::Utc::now()).await?;
//! zip.write_data(b"Hello, World!").await?;
//! let (bytes, size) = zip.finish().await?;
//! assert_eq!(bytes.len() as u64, size);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod encoder;
pub mod error;
pub mod location;
pub mod pipeline;
pub mod storage;
pub mod writer;

pub use config::{ArchiveConfig, S3Settings};
pub use encoder::{
    ArchiveEncoder, ArchiveEntry, ArchiveStream, EncodeSummary, EncoderOptions, EncoderState,
};
pub use error::{Error, ErrorKind, Result, StorageError};
pub use location::{ParsedLocation, Scheme};
pub use pipeline::{archive, ArchivePipeline, ArchiveResult};
pub use storage::{
    create_provider, FilesystemProvider, ListOptions, ObjectReader, StorageObject, StorageProvider,
    UploadOptions, UploadResult,
};
pub use writer::{CompressionMethod, ZipStreamWriter};

#[cfg(feature = "cloud-s3")]
pub use storage::{S3Provider, S3ProviderBuilder};
