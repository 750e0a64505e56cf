use std::path::{Path, PathBuf};
use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use upload_queue::utils::{format_bytes, format_eta, format_speed};
use upload_queue::{NewUpload, QueueConfig, QueueEvent, UploadQueue};

/// Queue local self-tape files and run them through the simulated uploader.
#[derive(Parser, Debug)]
#[command(name = "upload-queue", version)]
struct Cli {
    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Casting call the files belong to
    #[arg(long, default_value_t = 0)]
    casting_id: u64,

    /// Override `max_concurrent` from the config
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Files to upload
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

fn guess_mime_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());

    match extension.as_deref() {
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => QueueConfig::load(path)
            .with_context(|| format!("Can't load config {}", path.display()))?,
        None => QueueConfig::default(),
    };
    if let Some(max_concurrent) = cli.max_concurrent {
        config.max_concurrent = max_concurrent.max(1);
    }

    let handle = UploadQueue::from_config(config)?;
    let queue = handle.queue.clone();

    let mut events = queue.subscribe_events();
    let reporter = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                QueueEvent::Progress(progress) => info!(
                    "{} {:.1}% ({} / {}) {} eta {}",
                    progress.id,
                    progress.percentage,
                    format_bytes(progress.uploaded_bytes),
                    format_bytes(progress.total_bytes),
                    format_speed(progress.speed),
                    progress.eta.map(format_eta).unwrap_or_else(|| "-".to_string()),
                ),
                QueueEvent::Failed { id, error } => warn!("{} failed: {}", id, error),
                _ => {}
            }
        }
    });

    for path in &cli.files {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("Can't read {}", path.display()))?;
        if !metadata.is_file() {
            warn!("skipping {}: not a file", path.display());
            continue;
        }

        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let upload = NewUpload::new(
            format!("file://{}", path.display()),
            name,
            metadata.len(),
            guess_mime_type(path),
            cli.casting_id,
        );
        queue.enqueue(upload).await?;
    }

    queue.process_queue().await?;

    let stats = queue.stats().await?;
    println!(
        "{} completed, {} failed, {} paused, {} uploaded of {}",
        stats.completed,
        stats.failed,
        stats.paused,
        format_bytes(stats.uploaded_bytes),
        format_bytes(stats.total_bytes),
    );

    drop(queue);
    handle.shutdown().await?;
    reporter.abort();

    Ok(())
}
