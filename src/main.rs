//! s-zip-pipe command line
//!
//! Run with: s-zip-pipe s3://bucket/photos/ file://./photos.zip --compression-level 6

use clap::Parser;
use s_zip_pipe::{archive, ArchiveConfig, ArchiveResult, S3Settings};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "s-zip-pipe", version)]
#[command(
    about = "Stream a directory or S3 prefix into a ZIP archive on a filesystem or S3 target"
)]
struct Cli {
    /// Source location (file://<dir>/ or s3://<bucket>/<prefix>)
    #[arg(env = "SZIP_SOURCE")]
    source: String,

    /// Target archive (file://<path>.zip or s3://<bucket>/<key>.zip)
    #[arg(env = "SZIP_TARGET")]
    target: String,

    /// 0 stores entries uncompressed, 1-9 deflate
    #[arg(
        long,
        env = "SZIP_COMPRESSION_LEVEL",
        default_value_t = 9,
        value_parser = clap::value_parser!(u32).range(0..=9)
    )]
    compression_level: u32,

    /// Multipart upload part size in MB (5-5120)
    #[arg(long, env = "SZIP_PART_SIZE_MB", default_value_t = 5)]
    part_size_mb: usize,

    /// Upload parts in flight, also the number of source files opened ahead (1-16)
    #[arg(long, env = "SZIP_QUEUE_SIZE", default_value_t = 4)]
    queue_size: usize,

    /// Give up on the upload after this many seconds
    #[arg(long, env = "SZIP_UPLOAD_TIMEOUT_SECS")]
    upload_timeout_secs: Option<u64>,

    /// Lifetime of the presigned URL for S3 targets, in seconds
    #[arg(long, env = "SZIP_URL_EXPIRES_SECS", default_value_t = 3600)]
    url_expires_secs: u64,

    /// Custom S3 endpoint (MinIO, R2, LocalStack)
    #[arg(long, env = "AWS_ENDPOINT_URL")]
    endpoint_url: Option<String>,

    /// S3 region
    #[arg(long, env = "AWS_REGION")]
    region: Option<String>,

    /// Path-style S3 addressing, needed by most self-hosted stores
    #[arg(long, env = "SZIP_FORCE_PATH_STYLE")]
    force_path_style: bool,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn config(&self) -> ArchiveConfig {
        let mut config = ArchiveConfig::default()
            .with_compression_level(self.compression_level)
            .with_part_size(self.part_size_mb.saturating_mul(1024 * 1024))
            .with_queue_size(self.queue_size)
            .with_url_expires_in(Duration::from_secs(self.url_expires_secs))
            .with_s3(S3Settings {
                region: self.region.clone(),
                endpoint_url: self.endpoint_url.clone(),
                force_path_style: self.force_path_style,
            });
        if let Some(secs) = self.upload_timeout_secs {
            config = config.with_upload_timeout(Duration::from_secs(secs));
        }
        config
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_summary(result: &ArchiveResult) {
    println!("Archive:  {}", result.upload.location);
    println!(
        "Files:    {} of {} archived ({} bytes)",
        result.files_count, result.listed_count, result.archive_size
    );
    if let Some(url) = &result.upload.url {
        println!("URL:      {}", url);
    }
    if result.is_partial() {
        eprintln!("Warning: {} file(s) could not be read:", result.failed_count);
        for key in &result.failed_keys {
            eprintln!("  {}", key);
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = cli.config();
    tracing::debug!(
        peak_memory_mb = config.estimated_peak_memory_mb(),
        "Buffer budget"
    );

    match archive(&cli.source, &cli.target, &config).await {
        Ok(result) => {
            if cli.json {
                match serde_json::to_string_pretty(&result) {
                    Ok(json) => println!("{}", json),
                    Err(e) => {
                        eprintln!("Error: could not encode result: {}", e);
                        return ExitCode::FAILURE;
                    }
                }
            } else {
                print_summary(&result);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            if cli.json {
                let error = serde_json::json!({
                    "error": e.to_string(),
                    "kind": format!("{:?}", e.kind()),
                });
                println!("{}", error);
            } else {
                eprintln!("Error: {}", e);
            }
            ExitCode::FAILURE
        }
    }
}
