use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use lookout_core::{Watcher, WatcherOptions, WorkerOptions};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Poll a queue and run a command for every message it hands out.
#[derive(Parser, Debug)]
#[command(name = "lookout", author, version, about, long_about = None)]
struct Args {
    /// JSON file with watcher options (queueUrl, workerOptions, ...)
    #[arg(short, long, env = "LOOKOUT_CONFIG")]
    config: Option<PathBuf>,

    /// Queue to poll
    #[arg(long, env = "LOOKOUT_QUEUE_URL")]
    queue_url: Option<String>,

    /// Shell command each worker runs
    #[arg(long, env = "LOOKOUT_COMMAND")]
    command: Option<String>,

    /// Volumes opened up before each batch (comma-separated)
    #[arg(long, env = "LOOKOUT_VOLUMES", value_delimiter = ',')]
    volumes: Option<Vec<PathBuf>>,

    /// Max messages per poll
    #[arg(long, env = "LOOKOUT_BATCH_LIMIT")]
    batch_limit: Option<usize>,

    /// Long-poll wait in seconds
    #[arg(long, env = "LOOKOUT_POLL_TIMEOUT_SECS")]
    poll_timeout_secs: Option<u64>,

    /// Kill a worker after this many seconds
    #[arg(long, env = "LOOKOUT_MAX_JOB_DURATION_SECS")]
    max_job_duration_secs: Option<u64>,

    /// Log level, or a full filter directive (e.g. "lookout_core=debug")
    #[arg(long, default_value = "info", env = "LOOKOUT_LOG_LEVEL")]
    log_level: String,
}

impl Args {
    /// Config file first, flags on top.
    fn watcher_options(&self) -> Result<WatcherOptions> {
        let mut options = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => WatcherOptions::default(),
        };

        if let Some(queue_url) = &self.queue_url {
            options.queue_url = Some(queue_url.clone());
        }
        if let Some(command) = &self.command {
            match options.worker_options.as_mut() {
                Some(worker) => worker.command = command.clone(),
                None => options.worker_options = Some(WorkerOptions::new(command.clone())),
            }
        }
        if let Some(worker) = options.worker_options.as_mut() {
            if let Some(volumes) = &self.volumes {
                worker.volumes = volumes.clone();
            }
            if let Some(secs) = self.max_job_duration_secs {
                worker.max_job_duration = Some(Duration::from_secs(secs));
            }
        }
        if let Some(batch_limit) = self.batch_limit {
            options.batch_limit = batch_limit;
        }
        if let Some(secs) = self.poll_timeout_secs {
            options.poll_timeout = Duration::from_secs(secs);
        }
        Ok(options)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let watcher = Watcher::create(args.watcher_options()?)?;

    info!("Starting lookout v{}", env!("CARGO_PKG_VERSION"));
    info!("Queue: {}", watcher.queue_url());
    info!("Command: {}", watcher.worker_options().command);

    let stop = watcher.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current batch");
            stop.request_stop();
        }
    });

    watcher.listen().await.context("watcher stopped with an error")?;
    info!("lookout stopped");
    Ok(())
}
