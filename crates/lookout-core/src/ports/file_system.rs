use std::io;
use std::path::Path;

use async_trait::async_trait;

/// Open permissions applied to every volume before a batch starts.
pub const OPEN_PERMISSIONS: u32 = 0o777;

/// Filesystem collaborator used to prepare volumes.
#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn set_permissions(&self, path: &Path, mode: u32) -> io::Result<()>;
}
