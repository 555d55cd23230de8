//! End-to-end archive runs against the local filesystem
//!
//! Run with: cargo test --test pipeline_tests

mod common;

use common::{dir_uri, read_zip, seed, seed_bytes, zip_methods, FaultyProvider};
use s_zip_pipe::location::parse;
use s_zip_pipe::{
    archive, ArchiveConfig, ArchivePipeline, ErrorKind, FilesystemProvider, Result,
    StorageProvider,
};
use std::sync::Arc;
use tempfile::tempdir;

fn small_buffers() -> ArchiveConfig {
    ArchiveConfig::default()
        .with_queue_size(1)
        .with_chunk_size(1024)
}

#[tokio::test]
async fn test_two_files_scenario() -> Result<()> {
    let source = tempdir().unwrap();
    let target = tempdir().unwrap();
    seed(source.path(), &[("a.txt", "hello"), ("b/c.txt", "world")]);

    let target_uri = format!("file://{}/out.zip", target.path().display());
    let result = archive(&dir_uri(source.path()), &target_uri, &ArchiveConfig::default()).await?;

    assert_eq!(result.upload.key, "out.zip");
    assert_eq!(result.listed_count, 2);
    assert_eq!(result.files_count, 2);
    assert_eq!(result.failed_count, 0);
    assert!(!result.is_partial());

    let url = result.upload.url.as_deref().unwrap();
    assert!(url.starts_with("file://"));
    assert!(url.ends_with("/out.zip"));

    let zip_path = target.path().join("out.zip");
    assert_eq!(
        std::fs::metadata(&zip_path).unwrap().len(),
        result.archive_size
    );
    assert_eq!(
        read_zip(&zip_path),
        vec![
            ("a.txt".to_string(), b"hello".to_vec()),
            ("b/c.txt".to_string(), b"world".to_vec()),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_empty_source_leaves_target_untouched() {
    let source = tempdir().unwrap();
    let target = tempdir().unwrap();
    let target_dir = target.path().join("exports");

    let target_uri = format!("file://{}/out.zip", target_dir.display());
    let err = archive(&dir_uri(source.path()), &target_uri, &ArchiveConfig::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Archive);
    assert!(!target_dir.exists());
}

#[tokio::test]
async fn test_directories_only_is_an_archive_error() {
    let source = tempdir().unwrap();
    let target = tempdir().unwrap();
    std::fs::create_dir_all(source.path().join("a/b")).unwrap();
    std::fs::create_dir_all(source.path().join("c")).unwrap();

    let faulty = Arc::new(FaultyProvider::new());
    let pipeline = ArchivePipeline::new(faulty.clone(), faulty.clone());
    let target_uri = format!("file://{}/out.zip", target.path().display());
    let err = pipeline
        .run(&parse(&dir_uri(source.path())).unwrap(), &parse(&target_uri).unwrap())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Archive);
    assert!(faulty.created_containers.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_read_failure_skips_only_that_file() -> Result<()> {
    let source = tempdir().unwrap();
    let target = tempdir().unwrap();
    seed(
        source.path(),
        &[("1.txt", "one"), ("2.txt", "two"), ("3.txt", "three"), ("4.txt", "four")],
    );

    let faulty = FaultyProvider::new().fail_read("2.txt");
    let pipeline = ArchivePipeline::new(Arc::new(faulty), Arc::new(FilesystemProvider::new()))
        .with_config(small_buffers());
    let target_uri = format!("file://{}/out.zip", target.path().display());
    let result = pipeline
        .run(&parse(&dir_uri(source.path()))?, &parse(&target_uri)?)
        .await?;

    assert_eq!(result.listed_count, 4);
    assert_eq!(result.files_count, 3);
    assert_eq!(result.failed_count, 1);
    assert_eq!(result.failed_keys, ["2.txt"]);

    let entries = read_zip(&target.path().join("out.zip"));
    let names: Vec<_> = entries.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, ["1.txt", "3.txt", "4.txt"]);
    assert_eq!(entries[2].1, b"four");
    Ok(())
}

#[tokio::test]
async fn test_open_failure_skips_only_that_file() -> Result<()> {
    let source = tempdir().unwrap();
    let target = tempdir().unwrap();
    seed(source.path(), &[("a.txt", "a"), ("b.txt", "b"), ("c.txt", "c")]);

    let faulty = FaultyProvider::new().fail_open("a.txt");
    let pipeline = ArchivePipeline::new(Arc::new(faulty), Arc::new(FilesystemProvider::new()));
    let target_uri = format!("file://{}/out.zip", target.path().display());
    let result = pipeline
        .run(&parse(&dir_uri(source.path()))?, &parse(&target_uri)?)
        .await?;

    assert_eq!(result.files_count, 2);
    assert_eq!(result.failed_keys, ["a.txt"]);
    let names: Vec<_> = read_zip(&target.path().join("out.zip"))
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert_eq!(names, ["b.txt", "c.txt"]);
    Ok(())
}

#[tokio::test]
async fn test_every_file_failing_commits_nothing() {
    let source = tempdir().unwrap();
    let target = tempdir().unwrap();
    seed(source.path(), &[("a.txt", "a"), ("b.txt", "b")]);

    let faulty = FaultyProvider::new().fail_open("a.txt").fail_read("b.txt");
    let pipeline = ArchivePipeline::new(Arc::new(faulty), Arc::new(FilesystemProvider::new()));
    let target_uri = format!("file://{}/out.zip", target.path().display());
    let err = pipeline
        .run(&parse(&dir_uri(source.path())).unwrap(), &parse(&target_uri).unwrap())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Archive);
    let leftovers: Vec<_> = std::fs::read_dir(target.path()).unwrap().collect();
    assert!(leftovers.is_empty(), "{:?}", leftovers);
}

#[tokio::test]
async fn test_upload_failure_is_fatal() {
    let source = tempdir().unwrap();
    let target = tempdir().unwrap();
    let payload: Vec<u8> = (0..512 * 1024u32).map(|i| (i * 7 % 251) as u8).collect();
    seed_bytes(source.path(), "big.bin", &payload);
    seed(source.path(), &[("small.txt", "x")]);

    let pipeline = ArchivePipeline::new(
        Arc::new(FilesystemProvider::new()),
        Arc::new(FaultyProvider::new().fail_upload()),
    )
    .with_config(small_buffers());
    let target_uri = format!("file://{}/out.zip", target.path().display());
    let err = pipeline
        .run(&parse(&dir_uri(source.path())).unwrap(), &parse(&target_uri).unwrap())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::StorageOperation);
    assert!(err.to_string().contains("injected upload failure"));
    assert!(!target.path().join("out.zip").exists());
}

#[tokio::test]
async fn test_archive_committed_before_encoder_finished_is_deleted() {
    let source = tempdir().unwrap();
    let target = tempdir().unwrap();
    let payload: Vec<u8> = (0..512 * 1024u32).map(|i| (i * 13 % 251) as u8).collect();
    seed_bytes(source.path(), "big.bin", &payload);
    seed(source.path(), &[("small.txt", "x")]);

    let committing = Arc::new(FaultyProvider::new().commit_early());
    let pipeline = ArchivePipeline::new(Arc::new(FilesystemProvider::new()), committing.clone())
        .with_config(small_buffers().with_compression_level(0));
    let target_uri = format!("file://{}/out.zip", target.path().display());
    let target_location = parse(&target_uri).unwrap();
    let err = pipeline
        .run(&parse(&dir_uri(source.path())).unwrap(), &target_location)
        .await
        .unwrap_err();

    // The encoder lost its reader, and that is the error surfaced.
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(err.to_string().contains("archive consumer stopped reading"));

    let (container, key) = target_location.storage_pair();
    assert!(!committing.object_exists(&container, &key).await.unwrap());
    assert!(!target.path().join("out.zip").exists());
}

#[tokio::test]
async fn test_store_and_deflate_levels() -> Result<()> {
    let source = tempdir().unwrap();
    let target = tempdir().unwrap();
    let text = "the quick brown fox jumps over the lazy dog\n".repeat(2000);
    seed(source.path(), &[("fox.txt", text.as_str()), ("more/fox.txt", text.as_str())]);

    let stored_uri = format!("file://{}/stored.zip", target.path().display());
    let deflated_uri = format!("file://{}/deflated.zip", target.path().display());
    let stored = archive(
        &dir_uri(source.path()),
        &stored_uri,
        &ArchiveConfig::default().with_compression_level(0),
    )
    .await?;
    let deflated = archive(
        &dir_uri(source.path()),
        &deflated_uri,
        &ArchiveConfig::default().with_compression_level(9),
    )
    .await?;

    let stored_path = target.path().join("stored.zip");
    let deflated_path = target.path().join("deflated.zip");
    assert!(zip_methods(&stored_path)
        .iter()
        .all(|m| *m == zip::CompressionMethod::Stored));
    assert!(zip_methods(&deflated_path)
        .iter()
        .all(|m| *m == zip::CompressionMethod::Deflated));

    // Stored entries cost their raw size plus fixed header overhead.
    let raw = 2 * text.len() as u64;
    assert!(stored.archive_size > raw);
    assert!(stored.archive_size < raw + 1024);
    assert!(deflated.archive_size < stored.archive_size);
    assert_eq!(read_zip(&stored_path), read_zip(&deflated_path));
    Ok(())
}

#[tokio::test]
async fn test_round_trip_preserves_contents() -> Result<()> {
    let source = tempdir().unwrap();
    let target = tempdir().unwrap();

    let mut expected = Vec::new();
    for i in 0..20u32 {
        let key = format!("dir{}/file{:02}.bin", i % 3, i);
        let data: Vec<u8> = (0..(i * 9973 + 1)).map(|b| (b ^ i) as u8).collect();
        seed_bytes(source.path(), &key, &data);
        expected.push((key, data));
    }
    seed_bytes(source.path(), "empty.txt", b"");
    expected.push(("empty.txt".to_string(), Vec::new()));
    expected.sort();

    let target_uri = format!("file://{}/nested/round-trip.zip", target.path().display());
    let result = archive(&dir_uri(source.path()), &target_uri, &small_buffers()).await?;

    assert_eq!(result.files_count, expected.len());
    let mut actual = read_zip(&target.path().join("nested/round-trip.zip"));
    actual.sort();
    assert_eq!(actual, expected);
    Ok(())
}

#[tokio::test]
async fn test_prefix_selects_files() -> Result<()> {
    let source = tempdir().unwrap();
    let target = tempdir().unwrap();
    seed(
        source.path(),
        &[("logs-1.txt", "1"), ("logs-2.txt", "2"), ("notes.txt", "n")],
    );

    let source_uri = format!("file://{}/logs-", source.path().display());
    let target_uri = format!("file://{}/logs.zip", target.path().display());
    let result = archive(&source_uri, &target_uri, &ArchiveConfig::default()).await?;

    assert_eq!(result.listed_count, 2);
    let names: Vec<_> = read_zip(&target.path().join("logs.zip"))
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert_eq!(names, ["logs-1.txt", "logs-2.txt"]);
    Ok(())
}

#[tokio::test]
async fn test_configuration_errors_happen_before_io() {
    let target = tempdir().unwrap();
    let target_uri = format!("file://{}/out.zip", target.path().display());

    for (source, target) in [
        ("", target_uri.as_str()),
        ("ftp://host/dir/", target_uri.as_str()),
        ("s3:///prefix", target_uri.as_str()),
        ("file://./data/", "file://./exports/"),
    ] {
        let err = archive(source, target, &ArchiveConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration, "{} -> {}", source, target);
    }

    let err = archive(
        "file://./data/",
        &target_uri,
        &ArchiveConfig::default().with_compression_level(12),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[tokio::test]
async fn test_missing_source_directory() {
    let target = tempdir().unwrap();
    let target_uri = format!("file://{}/out.zip", target.path().display());
    let missing = format!("file://{}/does-not-exist/", target.path().display());

    let err = archive(&missing, &target_uri, &ArchiveConfig::default())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}
