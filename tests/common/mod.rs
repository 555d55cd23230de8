//! Shared fixtures for pipeline tests
#![allow(dead_code)]

use async_trait::async_trait;
use s_zip_pipe::storage::StorageResult;
use s_zip_pipe::{
    FilesystemProvider, ListOptions, ObjectReader, Scheme, StorageError, StorageObject,
    StorageProvider, UploadOptions, UploadResult,
};
use std::collections::HashSet;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncReadExt;

/// Filesystem provider that fails on demand
#[derive(Default)]
pub struct FaultyProvider {
    inner: FilesystemProvider,
    fail_open: HashSet<String>,
    fail_read: HashSet<String>,
    fail_upload: bool,
    commit_early: bool,
    pub created_containers: Mutex<Vec<String>>,
}

impl FaultyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// `get_object_stream` fails for this key.
    pub fn fail_open(mut self, key: &str) -> Self {
        self.fail_open.insert(key.to_string());
        self
    }

    /// The stream for this key yields a few bytes, then an error.
    pub fn fail_read(mut self, key: &str) -> Self {
        self.fail_read.insert(key.to_string());
        self
    }

    /// `upload_object` reads a little of the archive, then fails.
    pub fn fail_upload(mut self) -> Self {
        self.fail_upload = true;
        self
    }

    /// `upload_object` stores the first few bytes of the archive and reports success
    /// without reading the rest.
    pub fn commit_early(mut self) -> Self {
        self.commit_early = true;
        self
    }
}

#[async_trait]
impl StorageProvider for FaultyProvider {
    fn scheme(&self) -> Scheme {
        Scheme::Filesystem
    }

    async fn list_objects(
        &self,
        container: &str,
        options: &ListOptions,
    ) -> StorageResult<Vec<StorageObject>> {
        self.inner.list_objects(container, options).await
    }

    async fn get_object_stream(&self, container: &str, key: &str) -> StorageResult<ObjectReader> {
        if self.fail_open.contains(key) {
            return Err(StorageError::Operation {
                operation: "OpenFile",
                message: format!("injected open failure for {}", key),
            });
        }
        if self.fail_read.contains(key) {
            let mock = tokio_test::io::Builder::new()
                .read(b"first bytes of a file that breaks")
                .read_error(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "injected read failure",
                ))
                .build();
            return Ok(Box::new(mock));
        }
        self.inner.get_object_stream(container, key).await
    }

    async fn upload_object(
        &self,
        container: &str,
        key: &str,
        mut reader: ObjectReader,
        options: &UploadOptions,
    ) -> StorageResult<UploadResult> {
        if self.fail_upload {
            let mut buf = [0u8; 16];
            let _ = reader.read(&mut buf).await;
            return Err(StorageError::Operation {
                operation: "UploadObject",
                message: "injected upload failure".to_string(),
            });
        }
        if self.commit_early {
            let mut head = vec![0u8; 16];
            let n = reader.read(&mut head).await.unwrap_or(0);
            head.truncate(n);
            drop(reader);
            return self
                .inner
                .upload_object(container, key, Box::new(io::Cursor::new(head)), options)
                .await;
        }
        self.inner.upload_object(container, key, reader, options).await
    }

    async fn delete_object(&self, container: &str, key: &str) -> StorageResult<()> {
        self.inner.delete_object(container, key).await
    }

    async fn object_exists(&self, container: &str, key: &str) -> StorageResult<bool> {
        self.inner.object_exists(container, key).await
    }

    async fn get_object_url(
        &self,
        container: &str,
        key: &str,
        expires_in: Duration,
    ) -> StorageResult<String> {
        self.inner.get_object_url(container, key, expires_in).await
    }

    async fn create_container(&self, container: &str) -> StorageResult<()> {
        self.created_containers
            .lock()
            .unwrap()
            .push(container.to_string());
        self.inner.create_container(container).await
    }
}

/// Write text `files` (key, contents) below `root`.
pub fn seed(root: &Path, files: &[(&str, &str)]) {
    for (key, data) in files {
        seed_bytes(root, key, data.as_bytes());
    }
}

pub fn seed_bytes(root: &Path, key: &str, data: &[u8]) {
    let path = root.join(key);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, data).unwrap();
}

/// `file://` URI for a directory, with a trailing slash.
pub fn dir_uri(path: &Path) -> String {
    format!("file://{}/", path.display())
}

/// Entries of the ZIP at `path` as (name, contents), in central directory order.
pub fn read_zip(path: &Path) -> Vec<(String, Vec<u8>)> {
    let file = std::fs::File::open(path).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    (0..archive.len())
        .map(|i| {
            let mut entry = archive.by_index(i).unwrap();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            (entry.name().to_string(), data)
        })
        .collect()
}

/// Compression method of every entry in the ZIP at `path`.
pub fn zip_methods(path: &Path) -> Vec<zip::CompressionMethod> {
    let file = std::fs::File::open(path).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().compression())
        .collect()
}
