//! Ports - 抽象化レイヤー
//!
//! Watcher が依存する外部システムへのインターフェースです。
//! 実装は `impls` にあり、テストでは差し替えて使います。
//!
//! - **MessageSource**: キューからのバッチ取得と ack
//! - **WorkerFactory / Worker**: メッセージ 1 件の実行
//! - **FileSystem**: volume のパーミッション調整

pub mod message_source;
pub mod worker;
pub mod file_system;

pub use self::message_source::MessageSource;
pub use self::worker::{Worker, WorkerFactory};
pub use self::file_system::{FileSystem, OPEN_PERMISSIONS};
