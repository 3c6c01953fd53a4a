//! App - アプリケーション層
//!
//! ports を組み合わせてポーリングループを組み立てます。
//!
//! # 主要コンポーネント
//! - **Watcher**: poll → volume 準備 → fan-out → fan-in のループ
//! - **WatcherBuilder**: オプション検証と ports のワイヤリング

pub mod builder;
pub mod watcher;

pub use self::builder::WatcherBuilder;
pub use self::watcher::{StopHandle, Watcher};
