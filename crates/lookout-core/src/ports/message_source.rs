//! MessageSource port - リモートキューの抽象化
//!
//! Watcher はこの trait だけを見てポーリングします。
//! 本番は `SqsMessages`、開発・テストは `InMemoryMessages`。

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::Message;
use crate::error::QueueError;

/// Queue client bound to one queue address.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Wait for the next batch of at most `limit` messages.
    ///
    /// Resolves as soon as at least one message is available, or with an
    /// empty batch once `timeout` has elapsed. A timeout is not an error.
    async fn wait_for(&self, limit: usize, timeout: Duration) -> Result<Vec<Message>, QueueError>;

    /// The message was handled; remove it from the queue.
    async fn complete(&self, message: &Message) -> Result<(), QueueError>;

    /// The message was not handled; hand it out again later.
    async fn retry(&self, message: &Message) -> Result<(), QueueError>;
}
