//! Worker port - 1 メッセージ = 1 実行
//!
//! `WorkerFactory::create` は同期的に実行を開始し、
//! `Worker::wait_for` でその終了を待ちます。Worker 内部でのリトライはしません。

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{Message, WorkerOptions};
use crate::error::WorkerError;

/// One running (or finished) execution of a single message.
#[async_trait]
pub trait Worker: Send {
    fn message(&self) -> &Message;

    /// Wait for the execution to terminate. Consumes the worker.
    async fn wait_for(self: Box<Self>) -> Result<(), WorkerError>;
}

pub trait WorkerFactory: Send + Sync {
    /// Start one execution of `message` using the shared `options`.
    fn create(&self, message: Message, options: Arc<WorkerOptions>) -> Box<dyn Worker>;
}
