//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **SqsMessages**: 本番用のキュー（Amazon SQS）
//! - **InMemoryMessages**: 開発・テスト用のキュー
//! - **ProcessWorkerFactory**: メッセージごとにシェルコマンドを起動
//! - **LocalFileSystem**: volume の chmod

pub mod inmem_messages;
pub mod sqs_messages;
pub mod process_worker;
pub mod local_fs;

pub use self::inmem_messages::InMemoryMessages;
pub use self::sqs_messages::SqsMessages;
pub use self::process_worker::{ProcessWorker, ProcessWorkerFactory, EXIT_REJECTED};
pub use self::local_fs::LocalFileSystem;
