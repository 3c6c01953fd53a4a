//! LocalFileSystem - ボリュームの権限をローカルディスク上で変更する
//!
//! mode はそのまま chmod に渡す（umask は適用されない）。unix 専用。

#[cfg(not(unix))]
compile_error!("lookout-core sets volume permissions with unix modes and only builds on unix targets");

use std::io;
use std::path::Path;

use async_trait::async_trait;

use crate::ports::FileSystem;

/// `FileSystem` backed by the local disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn set_permissions(&self, path: &Path, mode: u32) -> io::Result<()> {
        tokio::fs::set_permissions(path, permissions(mode)).await
    }
}

#[cfg(unix)]
fn permissions(mode: u32) -> std::fs::Permissions {
    use std::os::unix::fs::PermissionsExt;
    std::fs::Permissions::from_mode(mode)
}
