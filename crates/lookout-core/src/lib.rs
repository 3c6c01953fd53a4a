//! lookout-core
//!
//! Queue-driven task runner: poll a queue, run one worker per message,
//! wait for the whole batch, repeat until asked to stop.
//!
//! # モジュール構成
//! - **domain**: Message, WatcherOptions, WorkerOptions
//! - **ports**: MessageSource, WorkerFactory / Worker, FileSystem
//! - **app**: Watcher（ポーリングループ）と WatcherBuilder
//! - **impls**: SQS / in-memory キュー、サブプロセス worker、ローカル FS
//! - **error**: WatchError, QueueError, WorkerError

pub mod domain;
pub mod ports;
pub mod app;
pub mod impls;
pub mod error;

pub use app::{StopHandle, Watcher, WatcherBuilder};
pub use domain::{Message, MessageId, WatcherOptions, WorkerOptions};
pub use error::{QueueError, WatchError, WorkerError};
