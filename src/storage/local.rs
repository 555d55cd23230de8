//! Local filesystem provider
//!
//! The container is a base directory (empty means the working directory) and keys are
//! slash-separated paths below it. Uploads are written to a hidden temporary file next to the
//! target and renamed into place only after the input stream ended cleanly.

use super::{
    ListOptions, ObjectReader, StorageObject, StorageProvider, StorageResult, UploadOptions,
    UploadResult,
};
use crate::error::StorageError;
use crate::location::Scheme;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufReader};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Filesystem-backed [`StorageProvider`]
#[derive(Debug, Clone, Default)]
pub struct FilesystemProvider {
    upload_timeout: Option<Duration>,
}

impl FilesystemProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_upload_timeout(mut self, timeout: Duration) -> Self {
        self.upload_timeout = Some(timeout);
        self
    }

    fn root(container: &str) -> PathBuf {
        if container.is_empty() {
            PathBuf::from(".")
        } else {
            PathBuf::from(container)
        }
    }

    /// Map a key onto a path below the container, rejecting traversal.
    fn key_to_path(container: &str, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() || key.ends_with('/') {
            return Err(StorageError::InvalidKey(format!(
                "'{}' does not name a file",
                key
            )));
        }
        if key.starts_with('/') || key.split('/').any(|segment| segment == "..") {
            return Err(StorageError::InvalidKey(format!(
                "'{}' escapes the storage directory",
                key
            )));
        }
        Ok(Self::root(container).join(key))
    }

    async fn write_temp_file(
        &self,
        temp_path: &Path,
        reader: ObjectReader,
    ) -> StorageResult<u64> {
        let copy = async {
            let mut file = fs::File::create(temp_path).await?;
            let mut reader = BufReader::with_capacity(COPY_BUFFER_SIZE, reader);
            let size = tokio::io::copy_buf(&mut reader, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok::<u64, io::Error>(size)
        };

        match self.upload_timeout {
            Some(after) => tokio::time::timeout(after, copy)
                .await
                .map_err(|_| StorageError::Timeout {
                    operation: "WriteFile",
                    after,
                })?
                .map_err(|e| StorageError::operation("WriteFile", e)),
            None => copy
                .await
                .map_err(|e| StorageError::operation("WriteFile", e)),
        }
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let nonce = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    path.with_file_name(format!(".{}.{}-{}.partial", name, std::process::id(), nonce))
}

fn is_temp_file(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(".partial")
}

fn not_found_or(operation: &'static str, container: &str, key: &str, e: io::Error) -> StorageError {
    if e.kind() == io::ErrorKind::NotFound {
        StorageError::not_found(container, key)
    } else {
        StorageError::operation(operation, e)
    }
}

#[async_trait]
impl StorageProvider for FilesystemProvider {
    fn scheme(&self) -> Scheme {
        Scheme::Filesystem
    }

    async fn list_objects(
        &self,
        container: &str,
        options: &ListOptions,
    ) -> StorageResult<Vec<StorageObject>> {
        let root = Self::root(container);
        let start = Instant::now();

        let root_meta = fs::metadata(&root)
            .await
            .map_err(|e| not_found_or("ListObjects", container, "", e))?;
        if !root_meta.is_dir() {
            return Err(StorageError::operation(
                "ListObjects",
                format!("{} is not a directory", root.display()),
            ));
        }

        let mut objects = Vec::new();
        let mut pending = vec![(root.clone(), String::new())];
        while let Some((dir, key_prefix)) = pending.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(|e| StorageError::operation("ListObjects", e))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StorageError::operation("ListObjects", e))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                if is_temp_file(&name) {
                    continue;
                }
                let key = format!("{}{}", key_prefix, name);
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| StorageError::operation("ListObjects", e))?;

                if file_type.is_dir() {
                    let marker = format!("{}/", key);
                    // Descend only where the prefix can still match.
                    if marker.starts_with(&options.prefix) || options.prefix.starts_with(&marker) {
                        pending.push((entry.path(), marker.clone()));
                    }
                    if marker.starts_with(&options.prefix) {
                        objects.push(StorageObject::new(marker));
                    }
                    continue;
                }
                if !key.starts_with(&options.prefix) {
                    continue;
                }

                // Follows symlinks; dangling links are skipped.
                let meta = match fs::metadata(entry.path()).await {
                    Ok(meta) if meta.is_file() => meta,
                    _ => continue,
                };
                objects.push(StorageObject {
                    key,
                    size: Some(meta.len()),
                    last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
                    etag: None,
                });
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        if let Some(max) = options.max_keys {
            objects.truncate(max);
        }

        tracing::debug!(
            path = %root.display(),
            prefix = %options.prefix,
            count = objects.len(),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Listed local objects"
        );
        Ok(objects)
    }

    async fn get_object_stream(&self, container: &str, key: &str) -> StorageResult<ObjectReader> {
        let path = Self::key_to_path(container, key)?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| not_found_or("OpenFile", container, key, e))?;
        Ok(Box::new(file))
    }

    async fn upload_object(
        &self,
        container: &str,
        key: &str,
        reader: ObjectReader,
        _options: &UploadOptions,
    ) -> StorageResult<UploadResult> {
        let path = Self::key_to_path(container, key)?;
        let start = Instant::now();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::operation("CreateDirectory", e))?;
        }

        let temp_path = temp_path_for(&path);
        let size = match self.write_temp_file(&temp_path, reader).await {
            Ok(size) => size,
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                tracing::error!(
                    error = %e,
                    path = %path.display(),
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "Local upload failed, nothing committed"
                );
                return Err(e);
            }
        };

        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::operation("RenameFile", e));
        }

        tracing::info!(
            path = %path.display(),
            key = %key,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local upload successful"
        );

        Ok(UploadResult {
            key: key.to_string(),
            location: path.display().to_string(),
            etag: None,
            version_id: None,
            url: None,
            size,
        })
    }

    async fn delete_object(&self, container: &str, key: &str) -> StorageResult<()> {
        let path = Self::key_to_path(container, key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "Local object deleted");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::operation("DeleteFile", e)),
        }
    }

    async fn object_exists(&self, container: &str, key: &str) -> StorageResult<bool> {
        let path = Self::key_to_path(container, key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::operation("StatFile", e)),
        }
    }

    async fn get_object_url(
        &self,
        container: &str,
        key: &str,
        _expires_in: Duration,
    ) -> StorageResult<String> {
        let path = Self::key_to_path(container, key)?;
        let absolute = fs::canonicalize(&path)
            .await
            .map_err(|e| not_found_or("ResolvePath", container, key, e))?;
        Ok(format!("file://{}", absolute.display()))
    }

    async fn create_container(&self, container: &str) -> StorageResult<()> {
        if container.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(container)
            .await
            .map_err(|e| StorageError::operation("CreateDirectory", e))
    }
}
