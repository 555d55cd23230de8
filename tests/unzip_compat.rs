mod common;

use common::{dir_uri, seed, seed_bytes};
use s_zip_pipe::{archive, ArchiveConfig};
use std::process::Command;
use tempfile::tempdir;

// Archives a small tree through the pipeline, then asks `unzip -t` to verify it.
// If `unzip` is not present on the system, the test will be skipped.

#[tokio::test]
async fn unzip_compatibility() {
    let check = Command::new("unzip").arg("-v").output();
    if check.is_err() {
        eprintln!("skipping test: `unzip` not found");
        return;
    }

    let source = tempdir().unwrap();
    let target = tempdir().unwrap();
    seed(source.path(), &[("hello.txt", "hello from test"), ("nested/dir/note.md", "# note")]);
    seed_bytes(source.path(), "big.bin", &vec![0u8; 1024 * 1024]);

    for level in [0, 6] {
        let zip_path = target.path().join(format!("compat-{}.zip", level));
        let target_uri = format!("file://{}", zip_path.display());
        let config = ArchiveConfig::default().with_compression_level(level);
        let result = archive(&dir_uri(source.path()), &target_uri, &config)
            .await
            .unwrap();
        assert_eq!(result.files_count, 3);

        let output = Command::new("unzip")
            .arg("-t")
            .arg(&zip_path)
            .output()
            .expect("failed to run unzip");
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        assert!(
            output.status.success(),
            "unzip reported failure for level {}: {} {}",
            level,
            stdout,
            stderr
        );
        assert!(stdout.contains("nested/dir/note.md"));
    }
}
