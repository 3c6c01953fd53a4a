//! WatcherBuilder - Watcher の構築とワイヤリング
//!
//! - 起動時検証（Fail-fast）: 必須オプションが無ければキューに触る前にエラー
//! - ports の差し替え: テストでは MessageSource / WorkerFactory / FileSystem を注入

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tokio::sync::watch;

use super::watcher::Watcher;
use crate::domain::WatcherOptions;
use crate::error::WatchError;
use crate::impls::{LocalFileSystem, ProcessWorkerFactory, SqsMessages};
use crate::ports::{FileSystem, MessageSource, WorkerFactory};

/// Builds a `Watcher`, filling in the production collaborators for anything
/// that was not injected.
///
/// # 使用例
/// ```ignore
/// let watcher = Watcher::builder(options)
///     .messages(Arc::new(InMemoryMessages::new()))
///     .build()?;
/// ```
pub struct WatcherBuilder {
    options: WatcherOptions,
    messages: Option<Arc<dyn MessageSource>>,
    workers: Option<Arc<dyn WorkerFactory>>,
    file_system: Option<Arc<dyn FileSystem>>,
}

impl WatcherBuilder {
    pub fn new(options: WatcherOptions) -> Self {
        Self {
            options,
            messages: None,
            workers: None,
            file_system: None,
        }
    }

    pub fn messages(mut self, messages: Arc<dyn MessageSource>) -> Self {
        self.messages = Some(messages);
        self
    }

    pub fn workers(mut self, workers: Arc<dyn WorkerFactory>) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn file_system(mut self, file_system: Arc<dyn FileSystem>) -> Self {
        self.file_system = Some(file_system);
        self
    }

    /// Validate the options and wire the watcher.
    ///
    /// `workerOptions` is checked before `queueUrl`, so a caller missing both
    /// hears about `workerOptions` first.
    pub fn build(self) -> Result<Watcher, WatchError> {
        let WatcherOptions {
            queue_url,
            worker_options,
            batch_limit,
            poll_timeout,
        } = self.options;

        let worker_options = worker_options.ok_or(WatchError::missing("workerOptions"))?;
        let queue_url = queue_url
            .filter(|url| !url.trim().is_empty())
            .ok_or(WatchError::missing("queueUrl"))?;

        if worker_options.command.trim().is_empty() {
            return Err(WatchError::InvalidOption {
                field: "workerOptions.command",
                reason: "must not be empty".to_string(),
            });
        }
        if batch_limit == 0 {
            return Err(WatchError::InvalidOption {
                field: "batchLimit",
                reason: "must be at least 1".to_string(),
            });
        }

        let messages = self
            .messages
            .unwrap_or_else(|| Arc::new(SqsMessages::new(queue_url.clone())));
        let workers = self
            .workers
            .unwrap_or_else(|| Arc::new(ProcessWorkerFactory::new(Arc::clone(&messages))));
        let file_system = self
            .file_system
            .unwrap_or_else(|| Arc::new(LocalFileSystem));

        // receiver は listen 側で使わない（sender から直接読む）ので捨ててよい
        let (stop_tx, _) = watch::channel(false);

        Ok(Watcher {
            queue_url,
            worker_options: Arc::new(worker_options),
            batch_limit,
            poll_timeout,
            messages,
            workers,
            file_system,
            stop_tx: Arc::new(stop_tx),
            listening: AtomicBool::new(false),
        })
    }
}
