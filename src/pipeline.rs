//! Streaming archive pipeline
//!
//! ```text
//!  source.list ─► [open ahead] ─► ArchiveEncoder ─► ArchiveStream ─► target.upload
//!                  (queue_size)     (bounded queue)    (bounded)       (spawned first)
//! ```
//!
//! The upload is spawned before the first source file is opened, so archive bytes leave the
//! process while later files are still downloading. Every stage is connected by a bounded
//! queue; a slow target slows the encoder, which slows the source reads. Up to
//! [`ArchiveConfig::max_open_sources`] source streams are open at once: `queue_size` opened
//! ahead, one waiting in `append`, and the encoder's `queue_size + 1`.
//!
//! A run ends in exactly one of two ways: an [`ArchiveResult`] for a committed archive with
//! at least one entry, or an error with nothing committed at the target.

use crate::config::ArchiveConfig;
use crate::encoder::{is_consumer_gone, ArchiveEncoder, ArchiveEntry, EncodeSummary, EncoderOptions};
use crate::error::{Error, Result};
use crate::location::{self, directory_of, ParsedLocation};
use crate::storage::{
    create_provider, ListOptions, StorageObject, StorageProvider, UploadOptions, UploadResult,
};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::pin::pin;
use std::sync::Arc;
use std::time::Instant;

/// Outcome of a successful run
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveResult {
    /// The committed archive, with its access URL when one could be produced
    pub upload: UploadResult,
    /// Files found under the source prefix (directory markers excluded)
    pub listed_count: usize,
    /// Entries in the archive
    pub files_count: usize,
    /// Files that could not be opened or read
    pub failed_count: usize,
    /// Source keys of the failed files: open failures first, then read failures
    pub failed_keys: Vec<String>,
    /// Archive size in bytes
    pub archive_size: u64,
}

impl ArchiveResult {
    /// True when some listed files are missing from the archive.
    pub fn is_partial(&self) -> bool {
        self.failed_count > 0
    }
}

/// Archive everything under `source_uri` into a ZIP at `target_uri`.
///
/// Providers are created from the location schemes; source and target may use different
/// backends.
///
/// ```no_run
/// # async fn example() -> s_zip_pipe::Result<()> {
/// use s_zip_pipe::{archive, ArchiveConfig};
///
/// let config = ArchiveConfig::default().with_compression_level(6);
/// let result = archive("file://./data/", "s3://exports/2024/data.zip", &config).await?;
/// println!("{} files -> {}", result.files_count, result.upload.location);
/// # Ok(())
/// # }
/// ```
pub async fn archive(
    source_uri: &str,
    target_uri: &str,
    config: &ArchiveConfig,
) -> Result<ArchiveResult> {
    config.validate()?;
    let source = location::parse(source_uri)?;
    let target = location::parse(target_uri)?;

    let source_provider = create_provider(source.scheme, config).await?;
    let target_provider = if target.scheme == source.scheme {
        Arc::clone(&source_provider)
    } else {
        create_provider(target.scheme, config).await?
    };

    ArchivePipeline::new(source_provider, target_provider)
        .with_config(config.clone())
        .run(&source, &target)
        .await
}

/// One source provider, one target provider, one configuration
pub struct ArchivePipeline {
    source: Arc<dyn StorageProvider>,
    target: Arc<dyn StorageProvider>,
    config: ArchiveConfig,
}

impl ArchivePipeline {
    pub fn new(source: Arc<dyn StorageProvider>, target: Arc<dyn StorageProvider>) -> Self {
        Self {
            source,
            target,
            config: ArchiveConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ArchiveConfig) -> Self {
        self.config = config;
        self
    }

    /// Archive every file under `source` into the object named by `target`.
    pub async fn run(
        &self,
        source: &ParsedLocation,
        target: &ParsedLocation,
    ) -> Result<ArchiveResult> {
        self.config.validate()?;
        let (source_container, prefix) = source.storage_pair();
        let (target_container, target_key) = target.storage_pair();
        if target_key.is_empty() {
            return Err(Error::Configuration(format!(
                "target '{}' does not name an archive file",
                target
            )));
        }

        let start = Instant::now();
        let listed = self
            .source
            .list_objects(&source_container, &ListOptions::with_prefix(prefix.clone()))
            .await?;
        let files: Vec<StorageObject> = listed
            .into_iter()
            .filter(|object| !object.is_directory_marker())
            .collect();
        if files.is_empty() {
            return Err(Error::Archive(format!("no files found under {}", source)));
        }

        tracing::info!(
            source = %source,
            target = %target,
            files = files.len(),
            compression_level = self.config.compression_level,
            "Starting archive"
        );

        self.target.create_container(&target_container).await?;

        let (mut encoder, archive_stream) = ArchiveEncoder::new(EncoderOptions {
            compression_level: self.config.compression_level,
            queue_size: self.config.queue_size,
            chunk_size: self.config.chunk_size,
        });

        let upload = {
            let target = Arc::clone(&self.target);
            let container = target_container.clone();
            let key = target_key.clone();
            let options = UploadOptions::zip();
            tokio::spawn(async move {
                target
                    .upload_object(&container, &key, Box::new(archive_stream), &options)
                    .await
            })
        };

        let base = directory_of(&prefix).to_string();
        let mut failed_keys = Vec::new();
        let ingested = self
            .ingest(&mut encoder, &source_container, &files, &base, &mut failed_keys)
            .await;

        let (encoded, uploaded) = match ingested {
            Ok(()) => tokio::join!(encoder.finalize(), upload),
            Err(e) => (Err(e), upload.await),
        };
        let uploaded = uploaded
            .map_err(|e| Error::Internal(format!("upload task failed: {}", e)))
            .and_then(|result| result.map_err(Error::from));

        let (summary, mut upload) = match (encoded, uploaded) {
            (Ok(summary), Ok(upload)) => (summary, upload),
            (Err(encode_err), Ok(upload)) => {
                // The archive stream should have failed the upload; never keep a broken archive.
                tracing::error!(
                    error = %encode_err,
                    key = %upload.key,
                    "Upload committed after the encoder failed, deleting it"
                );
                if let Err(e) = self.target.delete_object(&target_container, &target_key).await {
                    tracing::error!(
                        error = %e,
                        key = %target_key,
                        "Failed to delete broken archive"
                    );
                }
                return Err(encode_err);
            }
            (Ok(_), Err(upload_err)) => return Err(upload_err),
            (Err(encode_err), Err(upload_err)) => {
                return Err(if is_consumer_gone(&encode_err) {
                    upload_err
                } else {
                    encode_err
                })
            }
        };

        upload.url = match self
            .target
            .get_object_url(&target_container, &target_key, self.config.url_expires_in)
            .await
        {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::warn!(error = %e, key = %target_key, "Could not produce an access URL");
                None
            }
        };

        let result = build_result(upload, files.len(), &base, failed_keys, summary);
        if result.is_partial() {
            tracing::warn!(
                failed = result.failed_count,
                failed_keys = ?result.failed_keys,
                "Archive is missing files that could not be read"
            );
        }
        tracing::info!(
            location = %result.upload.location,
            files = result.files_count,
            failed = result.failed_count,
            size_bytes = result.archive_size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Archive complete"
        );
        Ok(result)
    }

    /// Open each file (a few ahead, in listing order) and hand it to the encoder.
    ///
    /// Files that cannot be opened are recorded in `failed_keys`. Only encoder failures
    /// are returned as errors.
    async fn ingest(
        &self,
        encoder: &mut ArchiveEncoder,
        container: &str,
        files: &[StorageObject],
        base: &str,
        failed_keys: &mut Vec<String>,
    ) -> Result<()> {
        let opens = stream::iter(files)
            .map(|object| async move {
                let opened = self.source.get_object_stream(container, &object.key).await;
                (object, opened)
            })
            .buffered(self.config.queue_size);
        let mut opens = pin!(opens);

        while let Some((object, opened)) = opens.next().await {
            match opened {
                Ok(reader) => {
                    let name = entry_name(&object.key, base);
                    let entry = ArchiveEntry::new(name, reader)
                        .with_modified(object.last_modified)
                        .with_size(object.size);
                    encoder.append(entry).await?;
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        key = %object.key,
                        "Could not open source file, skipping"
                    );
                    failed_keys.push(object.key.clone());
                }
            }
        }
        Ok(())
    }
}

/// Name of the archive entry for `key`: the key relative to the listed directory.
fn entry_name(key: &str, base: &str) -> String {
    key.strip_prefix(base).unwrap_or(key).to_string()
}

fn build_result(
    upload: UploadResult,
    listed_count: usize,
    base: &str,
    mut failed_keys: Vec<String>,
    summary: EncodeSummary,
) -> ArchiveResult {
    failed_keys.extend(
        summary
            .skipped
            .into_iter()
            .map(|skipped| format!("{}{}", base, skipped.name)),
    );
    ArchiveResult {
        upload,
        listed_count,
        files_count: summary.entries.len(),
        failed_count: failed_keys.len(),
        failed_keys,
        archive_size: summary.archive_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_name_is_relative_to_listed_directory() {
        assert_eq!(entry_name("photos/2024/a.jpg", "photos/"), "2024/a.jpg");
        assert_eq!(entry_name("a.txt", ""), "a.txt");
        assert_eq!(entry_name("b/c.txt", ""), "b/c.txt");
    }

    #[test]
    fn test_result_counts_open_and_read_failures() {
        let upload = UploadResult {
            key: "out.zip".to_string(),
            location: "/tmp/out.zip".to_string(),
            etag: None,
            version_id: None,
            url: None,
            size: 100,
        };
        let summary = EncodeSummary {
            entries: vec!["a.txt".to_string()],
            skipped: vec![crate::encoder::SkippedEntry {
                name: "c.txt".to_string(),
                reason: "reset".to_string(),
            }],
            uncompressed_bytes: 5,
            archive_size: 100,
        };

        let result = build_result(upload, 3, "data/", vec!["data/b.txt".to_string()], summary);
        assert_eq!(result.listed_count, 3);
        assert_eq!(result.files_count, 1);
        assert_eq!(result.failed_count, 2);
        assert_eq!(result.failed_keys, ["data/b.txt", "data/c.txt"]);
        assert!(result.is_partial());
    }
}
