//! Pipeline runs against a real S3-compatible endpoint
//!
//! Skipped unless `SZIP_TEST_S3_BUCKET` names an existing, writable bucket. Point the SDK at
//! MinIO or LocalStack with the usual variables:
//!
//! ```text
//! AWS_ENDPOINT_URL=http://localhost:9000 AWS_REGION=us-east-1 \
//! AWS_ACCESS_KEY_ID=minioadmin AWS_SECRET_ACCESS_KEY=minioadmin \
//! SZIP_FORCE_PATH_STYLE=1 SZIP_TEST_S3_BUCKET=szip-test cargo test --test s3_pipeline
//! ```
#![cfg(feature = "cloud-s3")]

mod common;

use common::read_zip;
use s_zip_pipe::{
    archive, ArchiveConfig, ErrorKind, S3Provider, S3Settings, StorageProvider, UploadOptions,
};
use std::io::Cursor;
use tempfile::tempdir;

fn test_bucket() -> Option<String> {
    match std::env::var("SZIP_TEST_S3_BUCKET") {
        Ok(bucket) if !bucket.is_empty() => Some(bucket),
        _ => {
            eprintln!("skipping test: SZIP_TEST_S3_BUCKET not set");
            None
        }
    }
}

fn settings() -> S3Settings {
    S3Settings {
        region: std::env::var("AWS_REGION").ok(),
        endpoint_url: std::env::var("AWS_ENDPOINT_URL").ok(),
        force_path_style: std::env::var("SZIP_FORCE_PATH_STYLE").is_ok(),
    }
}

fn unique_prefix(name: &str) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("s-zip-pipe-tests/{}-{}/", name, nanos)
}

async fn put(provider: &S3Provider, bucket: &str, key: &str, data: Vec<u8>) {
    provider
        .upload_object(bucket, key, Box::new(Cursor::new(data)), &UploadOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_s3_to_filesystem_and_back() {
    let Some(bucket) = test_bucket() else { return };
    let provider = S3Provider::builder()
        .settings(settings())
        .build()
        .await
        .unwrap();
    let prefix = unique_prefix("roundtrip");

    put(&provider, &bucket, &format!("{}a.txt", prefix), b"hello".to_vec()).await;
    put(&provider, &bucket, &format!("{}b/c.txt", prefix), b"world".to_vec()).await;

    let config = ArchiveConfig::default().with_s3(settings());
    let local = tempdir().unwrap();
    let local_uri = format!("file://{}/out.zip", local.path().display());
    let result = archive(&format!("s3://{}/{}", bucket, prefix), &local_uri, &config)
        .await
        .unwrap();
    assert_eq!(result.files_count, 2);
    assert_eq!(
        read_zip(&local.path().join("out.zip")),
        vec![
            ("a.txt".to_string(), b"hello".to_vec()),
            ("b/c.txt".to_string(), b"world".to_vec()),
        ]
    );

    let target_key = format!("{}archives/out.zip", prefix);
    let result = archive(
        &format!("s3://{}/{}", bucket, prefix),
        &format!("s3://{}/{}", bucket, target_key),
        &config,
    )
    .await
    .unwrap();
    assert_eq!(result.upload.key, target_key);
    assert!(result.upload.url.as_deref().unwrap().starts_with("http"));
    assert!(provider.object_exists(&bucket, &target_key).await.unwrap());

    for key in ["a.txt", "b/c.txt", "archives/out.zip"] {
        provider
            .delete_object(&bucket, &format!("{}{}", prefix, key))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_large_archive_uses_multipart() {
    let Some(bucket) = test_bucket() else { return };
    let provider = S3Provider::builder()
        .settings(settings())
        .build()
        .await
        .unwrap();
    let prefix = unique_prefix("multipart");

    // Incompressible and stored, so the archive spans three parts.
    let payload: Vec<u8> = (0..12 * 1024 * 1024u32)
        .map(|i| (i.wrapping_mul(2654435761) >> 24) as u8)
        .collect();
    put(&provider, &bucket, &format!("{}src/big.bin", prefix), payload.clone()).await;

    let local = tempdir().unwrap();
    let target_key = format!("{}big.zip", prefix);
    let config = ArchiveConfig::default()
        .with_compression_level(0)
        .with_s3(settings());
    let result = archive(
        &format!("s3://{}/{}src/", bucket, prefix),
        &format!("s3://{}/{}", bucket, target_key),
        &config,
    )
    .await
    .unwrap();
    assert!(result.archive_size > payload.len() as u64);

    // Pull the archive back down and check the entry survived the part boundaries.
    let local_uri = format!("file://{}/copy/", local.path().display());
    let copy = archive(
        &format!("s3://{}/{}", bucket, target_key),
        &format!("{}big.zip.zip", local_uri),
        &config,
    )
    .await
    .unwrap();
    assert_eq!(copy.files_count, 1);
    let outer = read_zip(&local.path().join("copy/big.zip.zip"));
    let inner_path = local.path().join("inner.zip");
    std::fs::write(&inner_path, &outer[0].1).unwrap();
    let inner = read_zip(&inner_path);
    assert_eq!(inner[0].0, "big.bin");
    assert!(inner[0].1 == payload);

    for key in ["src/big.bin", "big.zip"] {
        provider
            .delete_object(&bucket, &format!("{}{}", prefix, key))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_empty_prefix_is_an_archive_error() {
    let Some(bucket) = test_bucket() else { return };
    let prefix = unique_prefix("empty");
    let config = ArchiveConfig::default().with_s3(settings());

    let err = archive(
        &format!("s3://{}/{}", bucket, prefix),
        &format!("s3://{}/{}out.zip", bucket, prefix),
        &config,
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Archive);
}
